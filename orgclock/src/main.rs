use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use orgclock::aggregate::{GroupBy, Query, aggregate, habit_consistency};
use orgclock::config::Config;
use orgclock::core::{DateRange, OpenClockPolicy, Tag, Warning};
use orgclock::engine::{ArchivePolicy, Engine};
use orgclock::records::BuildOptions;
use orgclock::report;
use orgclock::source::{FileSource, Role, SourceSet};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "orgclock",
    about = "Clocked-time reports from Org outlines",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Configuration file layered over the user config.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse inputs and print records and warnings as JSON.
    Parse(ParseArgs),

    /// Clocked time per bucket over a date range.
    Breakdown(BreakdownArgs),

    /// Meetings per day over a date range.
    Meetings(MeetingsArgs),

    /// Habit consistency over a date range.
    Habits(HabitsArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Org files to read instead of the configured ones (`.org_archive` files are archives).
    inputs: Vec<PathBuf>,
    /// Always scan archive files.
    #[arg(long)]
    archives: bool,
    /// Count running clocks up to now.
    #[arg(long)]
    count_open: bool,
}

#[derive(Debug, Args)]
struct RangeArgs {
    /// First day of the range (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Day after the last day of the range (exclusive).
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Day whose week is reported when no range is given. Defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct ParseArgs {
    #[command(flatten)]
    input: InputArgs,
}

#[derive(Debug, Args)]
struct BreakdownArgs {
    #[command(flatten)]
    range: RangeArgs,
    #[command(flatten)]
    input: InputArgs,
    /// Grouping: tag, tags, state, habit, title, date or property:NAME.
    #[arg(long, default_value = "tag")]
    by: GroupBy,
    /// Only records carrying this tag.
    #[arg(long)]
    tag: Option<String>,
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct MeetingsArgs {
    #[command(flatten)]
    range: RangeArgs,
    #[command(flatten)]
    input: InputArgs,
    /// Tag that marks a meeting.
    #[arg(long, default_value = "meeting")]
    tag: String,
}

#[derive(Debug, Args)]
struct HabitsArgs {
    #[command(flatten)]
    range: RangeArgs,
    #[command(flatten)]
    input: InputArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let config = Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    config.validate()?;
    tracing::debug!(?config, "loaded configuration");

    let now = Local::now().naive_local();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(cli.command, &config, now, &mut out)
}

fn run(command: Commands, config: &Config, now: NaiveDateTime, out: &mut dyn Write) -> Result<()> {
    match command {
        Commands::Parse(args) => handle_parse(args, config, now, out),
        Commands::Breakdown(args) => handle_breakdown(args, config, now, out),
        Commands::Meetings(args) => handle_meetings(args, config, now, out),
        Commands::Habits(args) => handle_habits(args, config, now, out),
    }
}

fn handle_parse(args: ParseArgs, config: &Config, now: NaiveDateTime, out: &mut dyn Write) -> Result<()> {
    let engine = build_engine(config, &args.input, now)?;
    let analysis = if args.input.archives {
        engine.load_all()
    } else {
        engine.load_primary()
    }
    .context("failed to read sources")?;
    print_warnings(&analysis.warnings);
    let json = serde_json::to_string_pretty(&analysis).context("failed to serialize records")?;
    writeln!(out, "{json}")?;
    Ok(())
}

fn handle_breakdown(
    args: BreakdownArgs,
    config: &Config,
    now: NaiveDateTime,
    out: &mut dyn Write,
) -> Result<()> {
    let range = resolve_range(&args.range, now.date())?;
    let engine = build_engine(config, &args.input, now)?;
    let analysis = engine
        .collect(&range, archive_policy(&args.input))
        .context("failed to read sources")?;
    print_warnings(&analysis.warnings);

    let mut query = Query::new(range).with_open_clocks(open_clock_policy(config, &args.input, now));
    if let Some(tag) = &args.tag {
        query = query.with_tag(Tag::from(tag.as_str()));
    }
    let agg = aggregate(&analysis.records, &query, &args.by)?;
    if args.json {
        let json = serde_json::to_string_pretty(&report::structured(&agg))
            .context("failed to serialize report")?;
        writeln!(out, "{json}")?;
    } else {
        write!(out, "{}", report::render_breakdown(&agg))?;
    }
    Ok(())
}

fn handle_meetings(
    args: MeetingsArgs,
    config: &Config,
    now: NaiveDateTime,
    out: &mut dyn Write,
) -> Result<()> {
    let range = resolve_range(&args.range, now.date())?;
    let engine = build_engine(config, &args.input, now)?;
    let analysis = engine
        .collect(&range, archive_policy(&args.input))
        .context("failed to read sources")?;
    print_warnings(&analysis.warnings);

    let query = Query::new(range)
        .with_tag(Tag::from(args.tag.as_str()))
        .with_open_clocks(open_clock_policy(config, &args.input, now));
    let agg = aggregate(&analysis.records, &query, &GroupBy::Date)?;
    write!(out, "{}", report::render_meetings(&agg))?;
    Ok(())
}

fn handle_habits(args: HabitsArgs, config: &Config, now: NaiveDateTime, out: &mut dyn Write) -> Result<()> {
    let range = resolve_range(&args.range, now.date())?;
    let engine = build_engine(config, &args.input, now)?;
    let analysis = engine
        .collect(&range, archive_policy(&args.input))
        .context("failed to read sources")?;
    print_warnings(&analysis.warnings);

    let stats = habit_consistency(&analysis.records, &range);
    write!(out, "{}", report::render_habits(&stats, &range))?;
    Ok(())
}

fn build_engine(config: &Config, input: &InputArgs, now: NaiveDateTime) -> Result<Engine> {
    let sources = if input.inputs.is_empty() {
        config.sources()
    } else {
        sources_from_paths(&input.inputs)
    };
    if sources.is_empty() {
        bail!("no input files given and none configured (set `tasks` in config.toml)");
    }
    tracing::debug!(?sources, "resolved sources");
    let options = BuildOptions {
        open_clocks: open_clock_policy(config, input, now),
    };
    Ok(Engine::new(sources)
        .with_options(options)
        .with_window_lines(config.window_lines))
}

fn open_clock_policy(config: &Config, input: &InputArgs, now: NaiveDateTime) -> OpenClockPolicy {
    if input.count_open {
        OpenClockPolicy::CountUntil(now)
    } else {
        config.open_clock_policy(now)
    }
}

fn archive_policy(input: &InputArgs) -> ArchivePolicy {
    if input.archives {
        ArchivePolicy::Always
    } else {
        ArchivePolicy::IfNeeded
    }
}

fn role_for(path: &Path) -> Role {
    if path.extension().is_some_and(|ext| ext == "org_archive") {
        Role::Archive
    } else {
        Role::Tasks
    }
}

fn sources_from_paths(paths: &[PathBuf]) -> SourceSet {
    let mut set = SourceSet::new();
    for path in paths {
        set.add(role_for(path), FileSource::new(path));
    }
    set
}

/// `--from`/`--to` with a one-week default span; no flags means the week of `--today`.
fn resolve_range(args: &RangeArgs, today: NaiveDate) -> Result<DateRange> {
    let week = Duration::days(7);
    let (start, end) = match (args.from, args.to) {
        (Some(from), Some(to)) => (from, to),
        (Some(from), None) => (from, from + week),
        (None, Some(to)) => (to - week, to),
        (None, None) => {
            let range = DateRange::week_of(args.today.unwrap_or(today));
            (range.start, range.end)
        }
    };
    Ok(DateRange::new(start, end)?)
}

fn print_warnings(warnings: &[Warning]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::fs;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn range_args(from: Option<NaiveDate>, to: Option<NaiveDate>) -> RangeArgs {
        RangeArgs {
            from,
            to,
            today: None,
        }
    }

    fn noon(day: NaiveDate) -> NaiveDateTime {
        day.and_hms_opt(12, 0, 0).unwrap()
    }

    const TASKS: &str = "\
* Work :work:
** Standup :meeting:
SCHEDULED: <2025-11-13 Thu 09:00>
:LOGBOOK:
CLOCK: [2025-11-13 Thu 09:00]--[2025-11-13 Thu 09:20] =>  0:20
:END:
** Deep work
:LOGBOOK:
CLOCK: [2025-11-13 Thu 10:00]--[2025-11-13 Thu 11:40] =>  1:40
:END:
";

    fn run_cli(args: &[&str], now: NaiveDateTime) -> Result<String> {
        let cli = Cli::try_parse_from(args)?;
        let mut out = Vec::new();
        run(cli.command, &Config::default(), now, &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn range_defaults_to_week_of_today() {
        let range = resolve_range(&range_args(None, None), date(2025, 11, 13)).unwrap();
        assert_eq!((range.start, range.end), (date(2025, 11, 10), date(2025, 11, 17)));

        let pinned = RangeArgs {
            from: None,
            to: None,
            today: Some(date(2025, 11, 3)),
        };
        let range = resolve_range(&pinned, date(2025, 11, 13)).unwrap();
        assert_eq!(range.start, date(2025, 11, 3));
    }

    #[test]
    fn range_fills_in_missing_bound() {
        let today = date(2025, 11, 13);
        let from_only = resolve_range(&range_args(Some(date(2025, 11, 1)), None), today).unwrap();
        assert_eq!(from_only.end, date(2025, 11, 8));
        let to_only = resolve_range(&range_args(None, Some(date(2025, 11, 8))), today).unwrap();
        assert_eq!(to_only.start, date(2025, 11, 1));
    }

    #[test]
    fn inverted_range_is_an_error() {
        let args = range_args(Some(date(2025, 11, 8)), Some(date(2025, 11, 1)));
        assert!(resolve_range(&args, date(2025, 11, 13)).is_err());
    }

    #[test]
    fn archive_role_comes_from_extension() {
        assert_eq!(role_for(Path::new("notes/tasks.org")), Role::Tasks);
        assert_eq!(role_for(Path::new("notes/tasks.org_archive")), Role::Archive);
        let set = sources_from_paths(&[PathBuf::from("a.org"), PathBuf::from("a.org_archive")]);
        assert_eq!(set.primary().count(), 1);
        assert_eq!(set.role(Role::Archive).count(), 1);
    }

    #[test]
    fn breakdown_flags_parse() {
        let cli = Cli::try_parse_from([
            "orgclock",
            "--verbose",
            "breakdown",
            "--by",
            "property:CLIENT",
            "--tag",
            "work",
            "--from",
            "2025-11-01",
            "--archives",
            "tasks.org",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Breakdown(args) => {
                assert_eq!(args.by, GroupBy::Property("CLIENT".into()));
                assert_eq!(args.tag.as_deref(), Some("work"));
                assert_eq!(args.range.from, Some(date(2025, 11, 1)));
                assert!(args.input.archives);
                assert_eq!(args.input.inputs, vec![PathBuf::from("tasks.org")]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["orgclock", "breakdown", "--by", "weekday"]).is_err());
    }

    #[test]
    fn breakdown_over_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.org");
        fs::write(&path, TASKS).unwrap();
        let path = path.display().to_string();

        let now = noon(date(2025, 11, 14));
        let text = run_cli(&["orgclock", "breakdown", "--by", "tags", &path], now).unwrap();
        insta::assert_snapshot!(text, @r"
        Breakdown 2025-11-10..2025-11-17
        work            1:40   83%
        meeting:work    0:20   17%
        --------------------------
        total           2:00  100%  (2 records, 0 open clocks)
        ");
    }

    #[test]
    fn meetings_and_json_over_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.org");
        fs::write(&path, TASKS).unwrap();
        let path = path.display().to_string();
        let now = noon(date(2025, 11, 14));

        let meetings = run_cli(&["orgclock", "meetings", &path], now).unwrap();
        assert!(meetings.contains("  09:00-09:20   0:20  Standup\n"));

        let json = run_cli(&["orgclock", "breakdown", "--json", &path], now).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["total_minutes"], 120);
        assert_eq!(value["buckets"]["work"]["total_minutes"], 100);
    }

    #[test]
    fn parse_prints_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.org");
        fs::write(&path, TASKS).unwrap();
        let path = path.display().to_string();

        let json = run_cli(&["orgclock", "parse", &path], noon(date(2025, 11, 14))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["records"].as_array().unwrap().len(), 3);
        assert_eq!(value["records"][1]["total_clocked_minutes"], 20);
        assert_eq!(value["warnings"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn missing_sources_are_reported() {
        let err = run_cli(&["orgclock", "habits"], noon(date(2025, 11, 14))).unwrap_err();
        assert!(err.to_string().contains("no input files"));
    }
}
