use fern::{Dispatch, InitError};
use log::{Level, LevelFilter, Record};
use std::io;
use yansi::Paint;

pub fn setup_logging(filter: LevelFilter) -> Result<(), InitError> {
    if !atty::is(atty::Stream::Stderr) {
        Paint::disable();
    }

    let location = |record: &Record| match (record.file(), record.line()) {
        (Some(file), Some(line)) => format!(
            "{}{}{}",
            Paint::blue(file).bold(),
            Paint::new(":").bold(),
            Paint::magenta(line).bold()
        ),
        _ => String::new(),
    };

    let format_level = |record: &Record| match record.level() {
        level @ Level::Trace => Paint::green(level).bold(),
        level @ Level::Warn => Paint::yellow(level).bold(),
        level @ Level::Error => Paint::red(level).bold(),
        level => Paint::new(level).bold(),
    };

    Dispatch::new()
        // Exclude logs for crates that we use
        .level(LevelFilter::Off)
        // Include only the logs for relevant crates of interest
        .level_for("snapup", filter)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{:5}] {}: {}",
                format_level(record),
                strip_src(&location(record)),
                message
            ));
        })
        .chain(io::stderr())
        .apply()?;
    Ok(())
}

fn strip_src(input: &str) -> &str { input.split("src/").nth(1).unwrap_or_default() }

#[cfg(test)]
mod tests {
    #[test]
    fn strip_src() {
        assert_eq!(
            super::strip_src("/home/user/Sources/snapup/target/debug/build/src/executor.rs:42"),
            "executor.rs:42"
        )
    }
}
