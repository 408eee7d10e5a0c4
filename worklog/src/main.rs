use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration as StdDuration, Instant},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use worklog::config::Config;
use worklog::core::{
    Date, DateFormat, DomainError, Duration, EntrySummary, Record, ShouldTotal, Time, TimeFormat,
};
use worklog::format::serialise;
use worklog::parser::{self, ParsedFile, SyntaxError, Warning};
use worklog::reconciling::{Creator, ReconcileError, Reconciled, Reconciler, first_match};
use worklog::service::{self, Rounding};

#[derive(Debug, Parser)]
#[command(name = "worklog", about = "Plain-text time tracking", version)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Read settings from this file instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Date format of new records (YYYY-MM-DD or YYYY/MM/DD).
    #[arg(long, global = true)]
    date_format: Option<DateFormat>,
    /// Clock convention of new entries (24h or 12h).
    #[arg(long, global = true)]
    time_convention: Option<TimeFormat>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the total time of one or more files.
    Total(TotalArgs),

    /// Compare today's (or yesterday's) total with the previous ones.
    Now(NowArgs),

    /// Append an entry, creating the record if needed.
    Track(TrackArgs),

    /// Start an open-ended time range.
    Start(StartArgs),

    /// Close the open-ended time range.
    Stop(StopArgs),

    /// Add or extend a pause below the open-ended time range.
    Pause(PauseArgs),

    /// Create an empty record.
    Create(CreateArgs),

    /// Parse files, report warnings and verify they round-trip unchanged.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct TotalArgs {
    /// Record files; defaults to the configured file.
    files: Vec<PathBuf>,
    /// Count open ranges as if they ended now.
    #[arg(long)]
    now: bool,
    /// Also print the should-total and the difference to it.
    #[arg(long)]
    diff: bool,
    /// Round the total (5m, 10m, 15m, 30m or 60m).
    #[arg(long)]
    round: Option<Rounding>,
}

#[derive(Debug, Args)]
struct NowArgs {
    /// Record files; defaults to the configured file.
    files: Vec<PathBuf>,
    /// Also print should-totals, differences and estimated end times.
    #[arg(long)]
    diff: bool,
    /// Re-evaluate every second until interrupted.
    #[arg(long)]
    follow: bool,
}

#[derive(Debug, Args)]
struct FileArg {
    /// Record file; defaults to the configured file.
    #[arg(long, short)]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct TrackArgs {
    #[command(flatten)]
    file: FileArg,
    /// The entry, e.g. "1h30m Meeting" or "9:00 - 10:00".
    entry: String,
    /// Record date; defaults to today.
    #[arg(long)]
    date: Option<DateArg>,
    /// Should-total of a newly created record, e.g. 8h!.
    #[arg(long)]
    should: Option<ShouldTotal>,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[command(flatten)]
    file: FileArg,
    /// Start time; defaults to now.
    #[arg(long)]
    time: Option<Time>,
    /// Record date; defaults to today.
    #[arg(long)]
    date: Option<DateArg>,
    /// Summary of the new entry.
    #[arg(long, short)]
    summary: Option<String>,
    /// Round the start time.
    #[arg(long)]
    round: Option<Rounding>,
}

#[derive(Debug, Args)]
struct StopArgs {
    #[command(flatten)]
    file: FileArg,
    /// End time; defaults to now.
    #[arg(long)]
    time: Option<Time>,
    /// Record date; defaults to today, then yesterday.
    #[arg(long)]
    date: Option<Date>,
    /// Text to add to the entry's summary.
    #[arg(long, short)]
    summary: Option<String>,
    /// Round the end time.
    #[arg(long)]
    round: Option<Rounding>,
}

#[derive(Debug, Args)]
struct PauseArgs {
    #[command(flatten)]
    file: FileArg,
    /// Summary of the pause entry.
    #[arg(long, short)]
    summary: Option<String>,
    /// Grow the pause by this amount instead of adding a new one.
    #[arg(long, allow_hyphen_values = true)]
    extend: Option<Duration>,
    /// Keep growing the pause once per minute until interrupted.
    #[arg(long)]
    follow: bool,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[command(flatten)]
    file: FileArg,
    /// Record date; defaults to today.
    #[arg(long)]
    date: Option<DateArg>,
    /// Should-total of the record, e.g. 8h!.
    #[arg(long)]
    should: Option<ShouldTotal>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Record files; defaults to the configured file.
    files: Vec<PathBuf>,
}

/// A date given on the command line, with the format it was written in.
#[derive(Debug, Clone, Copy)]
struct DateArg {
    date: Date,
    format: DateFormat,
}

impl FromStr for DateArg {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (date, format) = parser::parse_date(s)?;
        Ok(Self { date, format })
    }
}

/// Settings and the moment the command was started.
struct App {
    config: Config,
    now: NaiveDateTime,
}

impl App {
    fn today(&self) -> Date {
        Date::from_naive(self.now.date())
    }

    fn date(&self, arg: Option<DateArg>) -> Date {
        arg.map_or_else(|| self.today(), |d| d.date)
    }

    /// The format of an explicitly written date wins for a new record header.
    fn config_for(&self, date: Option<DateArg>) -> Config {
        let mut config = self.config.clone();
        if let Some(d) = date {
            config.date_format = Some(d.format);
        }
        config
    }

    fn file(&self, arg: FileArg) -> Result<PathBuf> {
        arg.file
            .or_else(|| self.config.file.clone())
            .context("no record file given (pass --file or set `file` in the configuration)")
    }

    fn files(&self, args: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
        if !args.is_empty() {
            return Ok(args);
        }
        Ok(vec![self.file(FileArg { file: None })?])
    }

    /// Today, then yesterday (for a range running past midnight).
    fn current_creators(&self, date: Option<Date>) -> Vec<Creator> {
        match date {
            Some(d) => vec![Creator::AtRecord(d)],
            None => {
                let today = self.today();
                let mut creators = vec![Creator::AtRecord(today)];
                if let Ok(yesterday) = today.plus_days(-1) {
                    creators.push(Creator::AtRecord(yesterday));
                }
                creators
            }
        }
    }

    fn creators_with_fallback(&self, date: Date, should: Option<ShouldTotal>) -> [Creator; 2] {
        [
            Creator::AtRecord(date),
            Creator::NewRecord {
                date,
                should_total: should.or(self.config.default_should_total),
            },
        ]
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // An already installed subscriber is kept.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    if let Some(path) = cli.config.as_deref().filter(|p| !p.exists()) {
        anyhow::bail!("configuration file {} does not exist", path.display());
    }
    let mut config = Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    // Flags take precedence over the configuration.
    config.date_format = cli.date_format.or(config.date_format);
    config.time_convention = cli.time_convention.or(config.time_convention);
    tracing::debug!(?config, "loaded configuration");

    let app = App {
        config,
        now: Local::now().naive_local(),
    };
    match cli.command {
        Commands::Total(args) => handle_total(&app, args),
        Commands::Now(args) => handle_now(&app, args),
        Commands::Track(args) => handle_track(&app, args),
        Commands::Start(args) => handle_start(&app, args),
        Commands::Stop(args) => handle_stop(&app, args),
        Commands::Pause(args) => handle_pause(&app, args),
        Commands::Create(args) => handle_create(&app, args),
        Commands::Check(args) => handle_check(&app, args),
    }
}

fn handle_total(app: &App, args: TotalArgs) -> Result<()> {
    let records = read_records(&app.files(args.files)?)?;
    let mut total = if args.now {
        service::hypothetical_total(app.now, &records)
    } else {
        service::total(&records)
    };
    if let Some(rounding) = args.round {
        total = rounding.round(total);
    }
    println!("Total: {total}");
    if args.diff {
        let should = service::should_total_sum(&records);
        println!("Should: {should}");
        println!("Diff: {}", service::diff(should.duration, total).render_signed());
    }
    println!("({} record{})", records.len(), if records.len() == 1 { "" } else { "s" });
    Ok(())
}

fn handle_now(app: &App, args: NowArgs) -> Result<()> {
    let paths = app.files(args.files)?;
    if !args.follow {
        let records = read_records(&paths)?;
        print!("{}", now_report(&records, app.now, args.diff)?);
        return Ok(());
    }
    follow(StdDuration::from_secs(1), |counter| {
        let records = read_records(&paths)?;
        let report = now_report(&records, Local::now().naive_local(), args.diff)?;
        // Cursor home, clear screen.
        print!("\x1b[H\x1b[J{report}");
        if counter < 5 {
            println!("\nPress ^C to exit");
        }
        Ok(())
    })
}

/// Table of current, previous and grand totals.
fn now_report(records: &[Record], now: NaiveDateTime, with_diff: bool) -> Result<String> {
    let split = service::split_current_and_previous(Date::from_naive(now.date()), records)?;
    let current_date = split.current.first().map(|r| r.date);

    let current_total = service::hypothetical_total(now, split.current.iter().copied());
    let current_should = service::should_total_sum(split.current.iter().copied());
    let current_diff = service::diff(current_should.duration, current_total);

    let previous_total = service::hypothetical_total(now, split.previous.iter().copied());
    let previous_should = service::should_total_sum(split.previous.iter().copied());
    let previous_diff = service::diff(previous_should.duration, previous_total);

    let grand_total = current_total.saturating_plus(previous_total);
    let grand_should = current_should.duration.saturating_plus(previous_should.duration);
    let grand_diff = service::diff(grand_should, grand_total);

    let clock = current_date.and_then(|d| clock_time(now, d).ok());
    let end_time = |diff: Duration| {
        clock
            .and_then(|t| service::estimated_end_time(t, diff))
            .map_or_else(|| "???".to_string(), |t| t.to_string())
    };

    let mut out = format!("{:<10}{:>8}", "", "Total");
    if with_diff {
        out.push_str(&format!("{:>10}{:>9}{:>11}", "Should", "Diff", "End-Time"));
    }
    out.push('\n');

    let label = if split.is_today { "Today" } else { "Yesterday" };
    out.push_str(&format!("{label:<10}{:>8}", current_total.to_string()));
    if with_diff {
        out.push_str(&format!(
            "{:>10}{:>9}{:>11}",
            current_should.to_string(),
            current_diff.render_signed(),
            end_time(current_diff)
        ));
    }
    out.push('\n');

    out.push_str(&format!("{:<10}{:>8}", "Previous", previous_total.to_string()));
    if with_diff {
        out.push_str(&format!(
            "{:>10}{:>9}",
            previous_should.to_string(),
            previous_diff.render_signed()
        ));
    }
    out.push('\n');

    out.push_str(&format!("{:<10}{}\n", "", "=".repeat(if with_diff { 38 } else { 8 })));
    out.push_str(&format!("{:<10}{:>8}", "", grand_total.to_string()));
    if with_diff {
        out.push_str(&format!(
            "{:>10}{:>9}{:>11}",
            grand_should.to_string(),
            grand_diff.render_signed(),
            end_time(grand_diff)
        ));
    }
    out.push('\n');
    Ok(out)
}

fn handle_track(app: &App, args: TrackArgs) -> Result<()> {
    let entry = parser::parse_entry(&args.entry).context("invalid entry")?;
    let date = app.date(args.date);
    let path = app.file(args.file)?;
    let creators = app.creators_with_fallback(date, args.should);
    let config = app.config_for(args.date);
    let result = reconcile_file(&path, &config, &creators, |r| r.append_entry(&entry))?;
    print_changed(&result);
    Ok(())
}

fn handle_start(app: &App, args: StartArgs) -> Result<()> {
    let date = app.date(args.date);
    let path = app.file(args.file)?;
    let summary = summary_from(args.summary.as_deref())?;
    let rounding = args.round.or(app.config.default_rounding);
    let creators = app.creators_with_fallback(date, None);
    let config = app.config_for(args.date);
    let result = reconcile_file(&path, &config, &creators, |r| {
        let time = pick_time(args.time, app.now, r.date(), rounding)?;
        r.start_open_range(time, &summary)
    })?;
    print_changed(&result);
    Ok(())
}

fn handle_stop(app: &App, args: StopArgs) -> Result<()> {
    let path = app.file(args.file)?;
    let summary = summary_from(args.summary.as_deref())?;
    let rounding = args.round.or(app.config.default_rounding);
    let creators = app.current_creators(args.date);
    let result = reconcile_file(&path, &app.config, &creators, |r| {
        let time = pick_time(args.time, app.now, r.date(), rounding)?;
        r.close_open_range(time, &summary)
    })?;
    print_changed(&result);
    Ok(())
}

fn handle_pause(app: &App, args: PauseArgs) -> Result<()> {
    let path = app.file(args.file)?;
    let summary = summary_from(args.summary.as_deref())?;
    let creators = app.current_creators(None);

    let result = match args.extend {
        Some(amount) => {
            let delta = amount.abs().negate()?;
            reconcile_file(&path, &app.config, &creators, |r| r.extend_pause(delta, &summary))?
        }
        None => reconcile_file(&path, &app.config, &creators, |r| r.append_pause(&summary))?,
    };
    print_changed(&result);
    if !args.follow {
        return Ok(());
    }

    // Increments are derived from the start instant so they never drift.
    let started = Instant::now();
    let mut minutes_done = 0;
    follow(StdDuration::from_secs(1), |counter| {
        let elapsed = i64::try_from(started.elapsed().as_secs() / 60).unwrap_or(i64::MAX);
        let dots = ".".repeat((counter % 4) as usize);
        print!("\rPausing for {}{dots:<3}", Duration::from_minutes(elapsed));
        io::stdout().flush().context("writing to stdout")?;
        let increment = elapsed - minutes_done;
        if increment <= 0 {
            return Ok(());
        }
        let delta = Duration::from_minutes(-increment);
        reconcile_file(&path, &app.config, &creators, |r| {
            r.extend_pause(delta, &EntrySummary::default())
        })?;
        minutes_done = elapsed;
        Ok(())
    })?;
    println!();
    Ok(())
}

fn handle_create(app: &App, args: CreateArgs) -> Result<()> {
    let date = app.date(args.date);
    let path = app.file(args.file)?;
    let creator = Creator::NewRecord {
        date,
        should_total: args.should.or(app.config.default_should_total),
    };
    let config = app.config_for(args.date);
    let result = reconcile_file(&path, &config, &[creator], |r| r.ensure_record())?;
    print_changed(&result);
    Ok(())
}

fn handle_check(app: &App, args: CheckArgs) -> Result<()> {
    let paths = app.files(args.files)?;
    for path in &paths {
        let (records, warnings) = check_file(path)?;
        print_warnings(path, &warnings);
        println!("{}: {records} record(s), OK", path.display());
    }
    Ok(())
}

/* ---------------------------- file helpers ---------------------------- */

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn parse_file(path: &Path, text: &str) -> Result<ParsedFile> {
    let file = parser::parse(text).with_context(|| format!("parsing {}", path.display()))?;
    tracing::debug!(path = %path.display(), records = file.records().len(), "parsed file");
    Ok(file)
}

fn read_records(paths: &[PathBuf]) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for path in paths {
        let text = read_file(path)?;
        let file = parse_file(path, &text)?;
        print_warnings(path, file.warnings());
        records.extend(file.into_parts().0);
    }
    Ok(records)
}

/// Number of records and the warnings; fails unless the file round-trips.
fn check_file(path: &Path) -> Result<(usize, Vec<Warning>)> {
    let text = read_file(path)?;
    let file = parse_file(path, &text)?;
    if serialise(&file) != text {
        anyhow::bail!("{} does not round-trip unchanged", path.display());
    }
    Ok((file.records().len(), file.warnings().to_vec()))
}

/// Applies `edit` to the record chosen by the first matching creator and
/// stores the result. On any error the file is left as is.
fn reconcile_file(
    path: &Path,
    config: &Config,
    creators: &[Creator],
    edit: impl FnOnce(&Reconciler) -> Result<Reconciled, ReconcileError>,
) -> Result<Reconciled> {
    let text = if path.exists() {
        read_file(path)?
    } else {
        String::new()
    };
    let file = parse_file(path, &text)?;
    let reconciler = first_match(&file, creators)
        .context("no matching record (dated either today or yesterday)")?
        .with_style(config.apply_to(file.style()));
    tracing::debug!(date = %reconciler.date(), new = reconciler.is_new(), "bound record");

    let result = edit(&reconciler).context("cannot apply the change")?;
    if !result.changed.is_empty() {
        fs::write(path, &result.all_serialised).with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!(path = %path.display(), lines = ?result.replaced_lines, "wrote file");
    }
    Ok(result)
}

fn print_changed(result: &Reconciled) {
    if let Some(record) = result.record() {
        tracing::debug!(date = %record.date, entries = record.entries.len(), "edited record");
    }
    print!("{}", result.changed);
}

fn print_warnings(path: &Path, warnings: &[Warning]) {
    for w in warnings {
        eprintln!("warning: {}:{}: {}", path.display(), w.line, w.message);
    }
}

fn summary_from(text: Option<&str>) -> Result<EntrySummary> {
    let lines: Vec<&str> = text.map(|t| t.lines().map(str::trim).collect()).unwrap_or_default();
    EntrySummary::new(lines).context("invalid summary")
}

/// Wall-clock `now` expressed relative to the record dated `date`, so that
/// past midnight yesterday's record gets a `>` time.
fn clock_time(now: NaiveDateTime, date: Date) -> Result<Time, DomainError> {
    let days = date.days_until(Date::from_naive(now.date()));
    let minutes = i64::from(now.hour() * 60 + now.minute());
    Time::from_midnight_offset(days.saturating_mul(24 * 60).saturating_add(minutes))
}

fn pick_time(
    explicit: Option<Time>,
    now: NaiveDateTime,
    date: Date,
    rounding: Option<Rounding>,
) -> Result<Time, DomainError> {
    let time = match explicit {
        Some(t) => t,
        None => clock_time(now, date)?,
    };
    match rounding {
        Some(r) => r.round_time(time),
        None => Ok(time),
    }
}

/* ---------------------------- follow loop ---------------------------- */

/// Runs `tick` every `interval` until Ctrl-C is pressed.
fn follow(interval: StdDuration, tick: impl FnMut(u64) -> Result<()>) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let handle = Arc::clone(&stop);
    ctrlc::set_handler(move || handle.store(true, Ordering::SeqCst)).context("failed to set Ctrl-C handler")?;
    run_ticks(&stop, interval, tick)
}

/// Calls `tick` with a counter, sleeping `interval` in between, until `stop`
/// is set. The flag is polled in short steps while sleeping.
fn run_ticks(stop: &AtomicBool, interval: StdDuration, mut tick: impl FnMut(u64) -> Result<()>) -> Result<()> {
    let step = StdDuration::from_millis(100);
    let mut counter = 0;
    while !stop.load(Ordering::SeqCst) {
        tracing::debug!(counter, "tick");
        tick(counter)?;
        counter += 1;
        let deadline = Instant::now() + interval;
        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> Date {
        Date::new(y, m, d).unwrap()
    }

    fn app(now: NaiveDateTime) -> App {
        App {
            config: Config::default(),
            now,
        }
    }

    #[test]
    fn track_creates_missing_file_and_record() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("work.log");
        let entry = parser::parse_entry("2h").unwrap();
        let creators = app(at(1855, 4, 25, 12, 0)).creators_with_fallback(date(1855, 4, 25), None);

        reconcile_file(&path, &Config::default(), &creators, |r| r.append_entry(&entry)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1855-04-25\n\t2h\n");

        reconcile_file(&path, &Config::default(), &creators, |r| r.append_entry(&entry)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1855-04-25\n\t2h\n\t2h\n");
    }

    #[test]
    fn track_uses_configured_should_total_and_style() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("work.log");
        fs::write(&path, "\n1855/04/25\n\t1h\n").unwrap();
        let mut app = app(at(2000, 1, 1, 12, 0));
        app.config.default_should_total = Some("7h30m!".parse().unwrap());
        app.config.date_format = Some(DateFormat::Dashes);

        let entry = parser::parse_entry("2h").unwrap();
        let creators = app.creators_with_fallback(app.today(), None);
        reconcile_file(&path, &app.config, &creators, |r| r.append_entry(&entry)).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "\n1855/04/25\n\t1h\n\n2000-01-01 (7h30m!)\n\t2h\n"
        );
    }

    #[test]
    fn explicit_date_keeps_its_written_format() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("work.log");
        fs::write(&path, "\n1855/04/25\n\t1h\n").unwrap();
        let mut app = app(at(2020, 6, 1, 12, 0));
        app.config.date_format = Some(DateFormat::Slashes);

        let date: DateArg = "2000-01-01".parse().unwrap();
        assert_eq!(date.format, DateFormat::Dashes);
        let entry = parser::parse_entry("2h").unwrap();
        let creators = app.creators_with_fallback(app.date(Some(date)), None);
        let config = app.config_for(Some(date));
        reconcile_file(&path, &config, &creators, |r| r.append_entry(&entry)).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "\n1855/04/25\n\t1h\n\n2000-01-01\n\t2h\n"
        );

        let creators = app.creators_with_fallback(app.date(None), None);
        reconcile_file(&path, &app.config_for(None), &creators, |r| r.append_entry(&entry)).unwrap();
        assert!(fs::read_to_string(&path).unwrap().ends_with("\n2020/06/01\n\t2h\n"));
    }

    #[test]
    fn failed_edit_leaves_file_untouched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("work.log");
        let original = "2010-04-27\n    3:00 - 4:00\n";
        fs::write(&path, original).unwrap();
        let creators = [Creator::AtRecord(date(2010, 4, 27))];

        let err = reconcile_file(&path, &Config::default(), &creators, |r| {
            r.append_pause(&EntrySummary::default())
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("no open time range"));
        assert_eq!(fs::read_to_string(&path).unwrap(), original);

        let creators = [Creator::AtRecord(date(2010, 4, 28))];
        assert!(reconcile_file(&path, &Config::default(), &creators, |r| r.ensure_record()).is_err());
    }

    #[test]
    fn stop_closes_yesterdays_range_after_midnight() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("work.log");
        fs::write(&path, "2020-01-01\n\t22:00 - ?\n").unwrap();
        let app = app(at(2020, 1, 2, 1, 7));

        let creators = app.current_creators(None);
        let rounding = Some(Rounding::new(15).unwrap());
        reconcile_file(&path, &app.config, &creators, |r| {
            let time = pick_time(None, app.now, r.date(), rounding)?;
            r.close_open_range(time, &EntrySummary::default())
        })
        .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "2020-01-01\n\t22:00 - 1:00>\n");
    }

    #[test]
    fn clock_time_is_relative_to_the_record() {
        let now = at(2020, 1, 2, 8, 30);
        assert_eq!(clock_time(now, date(2020, 1, 2)).unwrap(), Time::new(8, 30).unwrap());
        let t = clock_time(now, date(2020, 1, 1)).unwrap();
        assert_eq!(t.midnight_offset(), 24 * 60 + 8 * 60 + 30);
        assert!(clock_time(now, date(2019, 12, 1)).is_err());
    }

    #[test]
    fn now_report_shows_current_and_previous() {
        let text = "2020-01-01 (8h)\n\t8:00 - 16:30\n\n2020-01-02 (8h!)\n\t9:00 - ?\n\t-30m\n";
        let records = parser::parse(text).unwrap().into_parts().0;
        let report = now_report(&records, at(2020, 1, 2, 12, 0), true).unwrap();
        let lines: Vec<&str> = report.lines().collect();
        assert!(lines[1].starts_with("Today"));
        assert!(lines[1].contains("2h30m"));
        assert!(lines[1].contains("-5h30m"));
        assert!(lines[1].ends_with("17:30"));
        assert!(lines[2].starts_with("Previous"));
        assert!(lines[2].contains("8h30m"));
        assert!(lines[2].contains("+30m"));
        assert!(lines[4].contains("11h"));
        assert!(lines[4].ends_with("17:00"));

        let err = now_report(&records, at(2020, 3, 1, 12, 0), false).unwrap_err();
        assert!(err.to_string().contains("no current record"));
    }

    #[test]
    fn check_accepts_files_that_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("work.log");
        fs::write(&path, "2020-01-01\r\n  1h\r\n\r\n2020-01-02\r\n").unwrap();
        let (records, warnings) = check_file(&path).unwrap();
        assert_eq!(records, 2);
        assert_eq!(warnings.len(), 1);

        fs::write(&path, "2020-01-01\n  oops\n").unwrap();
        assert!(check_file(&path).is_err());
    }

    #[test]
    fn run_ticks_stops_when_flag_is_set() {
        let stop = AtomicBool::new(false);
        let mut seen = vec![];
        run_ticks(&stop, StdDuration::from_millis(1), |counter| {
            seen.push(counter);
            if counter == 2 {
                stop.store(true, Ordering::SeqCst);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, [0, 1, 2]);
    }

    #[test]
    fn run_ticks_propagates_errors() {
        let stop = AtomicBool::new(false);
        let result = run_ticks(&stop, StdDuration::from_millis(1), |_| anyhow::bail!("boom"));
        assert!(result.is_err());
    }

    #[test]
    fn summaries_from_flags() {
        assert!(summary_from(None).unwrap().is_empty());
        assert_eq!(summary_from(Some("Lunch\n break")).unwrap().lines(), ["Lunch", "break"]);
    }
}
