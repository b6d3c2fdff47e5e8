//! Command-line surface (SPEC_FULL.md §10).
//!
//! Built with `clap`'s builder API, one `Arg` per row of the flag table. Parsing only
//! populates a `Control`; every piece of option-validation logic beyond what `clap` itself
//! enforces (mutually exclusive size sources, watch-pid vs. input-file exclusivity, etc.)
//! lives in `validate`, returning `Error::OptionValidation` the way `pv_state` setters in
//! the original reject bad combinations up front rather than failing mid-transfer.

use std::path::PathBuf;
use std::str::FromStr;

use clap::{App, Arg};

use error::{Error, Result};
use state::{BarStyle, Control, DisplaySwitches};

const ABOUT: &str = "Monitor the progress of data through a pipeline.";

pub fn build_app<'a, 'b>() -> App<'a, 'b> {
    App::new("pv")
        .about(ABOUT)
        .arg(Arg::with_name("progress").short("p").long("progress").help("Show the progress bar"))
        .arg(Arg::with_name("timer").short("t").long("timer").help("Show the elapsed time"))
        .arg(Arg::with_name("eta").short("e").long("eta").help("Show the estimated time to completion"))
        .arg(Arg::with_name("fineta").short("I").long("fineta").help("Show the estimated completion time of day"))
        .arg(Arg::with_name("rate").short("r").long("rate").help("Show the current transfer rate"))
        .arg(Arg::with_name("average-rate").short("a").long("average-rate").help("Show the average transfer rate"))
        .arg(Arg::with_name("bytes").short("b").long("bytes").help("Show the number of bytes transferred"))
        .arg(Arg::with_name("buffer-percent").short("T").long("buffer-percent").help("Show the buffer usage percentage"))
        .arg(Arg::with_name("last-written").short("A").long("last-written").help("Show the last bytes written"))
        .arg(Arg::with_name("name").short("N").long("name").takes_value(true).help("Prefix the output with NAME"))
        .arg(Arg::with_name("format").short("F").long("format").takes_value(true).help("Use a custom format string"))
        .arg(Arg::with_name("numeric").short("n").long("numeric").help("Output percentages, not visual information"))
        .arg(Arg::with_name("quiet").short("q").long("quiet").help("Do not output any transfer information at all"))
        .arg(Arg::with_name("wait").short("W").long("wait").help("Wait until the first byte before showing progress"))
        .arg(Arg::with_name("delay-start").short("D").long("delay-start").takes_value(true).help("Wait this many seconds before showing progress"))
        .arg(Arg::with_name("interval").short("i").long("interval").takes_value(true).help("Update interval, in seconds"))
        .arg(Arg::with_name("line-mode").short("l").long("line-mode").help("Count lines instead of bytes"))
        .arg(Arg::with_name("null").short("0").long("null").help("Use a null terminator for line counting"))
        .arg(Arg::with_name("bits").short("8").long("bits").help("Count and display bits, not bytes"))
        .arg(Arg::with_name("skip-errors").long("skip-errors").help("Skip read errors instead of aborting"))
        .arg(Arg::with_name("error-skip-block").long("error-skip-block").takes_value(true).help("Bytes to skip forward after a read error"))
        .arg(Arg::with_name("buffer-size").short("B").long("buffer-size").takes_value(true).help("Use a buffer of SIZE bytes"))
        .arg(Arg::with_name("size").short("s").long("size").takes_value(true).help("Assume the total transfer size is SIZE"))
        .arg(Arg::with_name("stop-at-size").short("S").long("stop-at-size").help("Stop transferring once SIZE has been reached"))
        .arg(Arg::with_name("sync").short("Y").long("sync").help("Sync the output file after every write"))
        .arg(Arg::with_name("rate-limit").short("L").long("rate-limit").takes_value(true).help("Limit transfer to RATE bytes per second"))
        .arg(Arg::with_name("direct-io").long("direct-io").help("Use direct I/O for input and output"))
        .arg(Arg::with_name("discard").long("discard").help("Discard input instead of writing it anywhere"))
        .arg(Arg::with_name("no-splice").long("no-splice").help("Never use splice(2), always use read/write"))
        .arg(Arg::with_name("cursor").short("c").long("cursor").help("Use cursor positioning instead of a simple progress line"))
        .arg(Arg::with_name("force").short("f").long("force").help("Output even when stderr is not a terminal"))
        .arg(Arg::with_name("width").short("w").long("width").takes_value(true).help("Assume the terminal is WIDTH columns wide"))
        .arg(Arg::with_name("height").short("H").long("height").takes_value(true).help("Assume the terminal is HEIGHT rows tall"))
        .arg(Arg::with_name("name-width").long("name-width").takes_value(true).help("Column width reserved for --name"))
        .arg(Arg::with_name("average-rate-window").long("average-rate-window").takes_value(true).help("Average rate smoothing window, in seconds"))
        .arg(Arg::with_name("show-stats").long("show-stats").help("Print a final rate summary on exit"))
        .arg(Arg::with_name("rate-gauge").short("G").long("rate-gauge").help("Unknown-size progress bar driven by peak rate"))
        .arg(Arg::with_name("bar-style").long("bar-style").takes_value(true).help("Progress bar style: plain, block, granular, shaded"))
        .arg(Arg::with_name("watch-pid").long("watch-pid").takes_value(true).help("Watch the progress of an already-running process"))
        .arg(Arg::with_name("watch-fd").short("d").long("watch-fd").takes_value(true).requires("watch-pid").help("Which fd of --watch-pid to watch"))
        .arg(Arg::with_name("remote").long("remote").takes_value(true).help("Reconfigure an already-running pv instance by pid"))
        .arg(Arg::with_name("decimal").short("k").long("decimal").help("Use decimal, not binary, units for byte counts"))
        .arg(Arg::with_name("input").multiple(true).help("Input file(s); omit, or use -, for stdin"))
}

/// Parses already-tokenized arguments (`std::env::args()` in `main`, a fixed `Vec` in
/// tests) into a `Control`, then runs cross-field validation.
pub fn parse_control(args: Vec<String>) -> Result<Control> {
    let matches = build_app().get_matches_from_safe(args).map_err(|e| Error::OptionValidation { message: e.message })?;

    let mut control = Control::default();

    control.cursor = matches.is_present("cursor");
    control.numeric = matches.is_present("numeric");
    control.no_display = matches.is_present("quiet");
    control.wait = matches.is_present("wait");
    control.linemode = matches.is_present("line-mode");
    control.null_terminated_lines = matches.is_present("null");
    control.bits = matches.is_present("bits");
    control.stop_at_size = matches.is_present("stop-at-size");
    control.sync_after_write = matches.is_present("sync");
    control.direct_io = matches.is_present("direct-io");
    control.discard_input = matches.is_present("discard");
    control.no_splice = matches.is_present("no-splice");
    control.force = matches.is_present("force");
    control.show_stats = matches.is_present("show-stats");
    control.rate_gauge = matches.is_present("rate-gauge");
    control.decimal_units = matches.is_present("decimal");
    control.width_set_manually = matches.is_present("width");
    control.height_set_manually = matches.is_present("height");

    let mut switches = DisplaySwitches::empty();
    for (present, flag) in &[
        (matches.is_present("progress"), DisplaySwitches::PROGRESS),
        (matches.is_present("timer"), DisplaySwitches::TIMER),
        (matches.is_present("eta"), DisplaySwitches::ETA),
        (matches.is_present("fineta"), DisplaySwitches::FINETA),
        (matches.is_present("rate"), DisplaySwitches::RATE),
        (matches.is_present("average-rate"), DisplaySwitches::AVERAGE_RATE),
        (matches.is_present("bytes"), DisplaySwitches::BYTES),
        (matches.is_present("buffer-percent"), DisplaySwitches::BUFFER_PERCENT),
        (matches.is_present("last-written"), DisplaySwitches::LAST_WRITTEN),
    ] {
        if *present {
            switches.insert(*flag);
        }
    }
    control.display_switches = switches;

    if let Some(v) = matches.value_of("name") {
        control.name = Some(v.to_string());
    }
    if let Some(v) = matches.value_of("format") {
        control.format_string = Some(v.to_string());
    }
    if let Some(v) = matches.value_of("interval") {
        control.interval = parse_num(v, "--interval")?;
    }
    if let Some(v) = matches.value_of("delay-start") {
        control.delay_start = parse_num(v, "--delay-start")?;
    }
    if let Some(v) = matches.value_of("size") {
        control.size = parse_size(v, "--size")?;
    }
    if let Some(v) = matches.value_of("buffer-size") {
        control.target_buffer_size = parse_size(v, "--buffer-size")? as usize;
    }
    if let Some(v) = matches.value_of("width") {
        control.width = parse_size(v, "--width")? as u32;
    }
    if let Some(v) = matches.value_of("height") {
        control.height = parse_size(v, "--height")? as u32;
    }
    if let Some(v) = matches.value_of("name-width") {
        control.name_width = parse_size(v, "--name-width")? as usize;
    }
    if let Some(v) = matches.value_of("average-rate-window") {
        control.set_average_rate_window(parse_size(v, "--average-rate-window")? as u32);
    }
    if matches.is_present("skip-errors") {
        control.skip_errors = 1;
    }
    if let Some(v) = matches.value_of("error-skip-block") {
        control.error_skip_block = parse_size(v, "--error-skip-block")?;
    }
    if let Some(v) = matches.value_of("rate-limit") {
        control.rate_limit = parse_size(v, "--rate-limit")?;
    }
    if let Some(v) = matches.value_of("watch-pid") {
        control.watch_pid = parse_size(v, "--watch-pid")? as u32;
    }
    if let Some(v) = matches.value_of("watch-fd") {
        control.watch_fd = parse_size(v, "--watch-fd")? as i32;
    } else {
        control.watch_fd = -1;
    }
    if let Some(v) = matches.value_of("bar-style") {
        let name = if v == "default" { "plain" } else { v };
        control.bar_style = BarStyle::from_str(name)
            .map_err(|_| Error::OptionValidation { message: format!("unknown bar style: {}", v) })?;
    }

    control.input_files = matches
        .values_of("input")
        .map(|vs| vs.map(PathBuf::from).collect())
        .unwrap_or_default();

    validate(&control)?;
    Ok(control)
}

fn parse_num(value: &str, flag: &str) -> Result<f64> {
    value.parse::<f64>().map_err(|_| Error::OptionValidation { message: format!("{}: not a number: {}", flag, value) })
}

fn parse_size(value: &str, flag: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| Error::OptionValidation { message: format!("{}: not a whole number: {}", flag, value) })
}

/// Cross-field checks `clap` itself has no vocabulary for (`pv_state`'s validation pass in
/// the original): watch-pid transfers don't read stdin and so can't take input files, and a
/// rate-limit of zero is the same as not passing `-L` at all, so it's rejected as likely a
/// typo rather than silently ignored.
fn validate(control: &Control) -> Result<()> {
    if control.watch_pid != 0 && !control.input_files.is_empty() {
        return Err(Error::OptionValidation { message: "--watch-pid cannot be combined with input files".to_string() });
    }
    if control.interval <= 0.0 {
        return Err(Error::OptionValidation { message: "--interval must be positive".to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Vec<String> {
        let mut v = vec!["pv".to_string()];
        v.extend(extra.iter().map(|s| s.to_string()));
        v
    }

    #[test]
    fn defaults_have_no_input_files() {
        let control = parse_control(args(&[])).unwrap();
        assert!(control.input_files.is_empty());
    }

    #[test]
    fn size_flag_sets_control_size() {
        let control = parse_control(args(&["-s", "1024"])).unwrap();
        assert_eq!(control.size, 1024);
    }

    #[test]
    fn bar_style_flag_maps_to_enum() {
        let control = parse_control(args(&["--bar-style", "block"])).unwrap();
        assert_eq!(control.bar_style, BarStyle::Block);
    }

    #[test]
    fn unknown_bar_style_is_rejected() {
        let result = parse_control(args(&["--bar-style", "nonsense"]));
        assert!(result.is_err());
    }

    #[test]
    fn rate_gauge_short_flag_sets_control() {
        let control = parse_control(args(&["-G"])).unwrap();
        assert!(control.rate_gauge);
    }

    #[test]
    fn watch_pid_with_input_files_is_rejected() {
        let result = parse_control(args(&["--watch-pid", "1", "file.txt"]));
        assert!(result.is_err());
    }

    #[test]
    fn input_files_are_collected_in_order() {
        let control = parse_control(args(&["a.txt", "b.txt"])).unwrap();
        assert_eq!(control.input_files, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
    }

    #[test]
    fn display_selector_flags_set_display_switches() {
        let control = parse_control(args(&["-b", "-p"])).unwrap();
        assert!(control.display_switches.contains(DisplaySwitches::BYTES));
        assert!(control.display_switches.contains(DisplaySwitches::PROGRESS));
        assert!(!control.display_switches.contains(DisplaySwitches::TIMER));
    }

    #[test]
    fn no_display_selector_flags_leaves_switches_empty() {
        let control = parse_control(args(&[])).unwrap();
        assert!(control.display_switches.is_empty());
    }
}
