use std::path::Path;

use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

fn level_from_str(level: &str) -> LevelFilter {
	match level.to_lowercase().as_str() {
		"trace" => LevelFilter::Trace,
		"debug" => LevelFilter::Debug,
		"warn" => LevelFilter::Warn,
		"error" => LevelFilter::Error,
		_ => LevelFilter::Info,
	}
}

/// Initialize logging: colored console output plus a date-rotated file under
/// `log_dir`. Safe to call once per process; later calls return an error from
/// `log::set_logger` which callers may ignore in tests.
pub fn init(level: &str, log_dir: &Path) -> anyhow::Result<()> {
	std::fs::create_dir_all(log_dir)?;

	let colors = ColoredLevelConfig::new()
		.trace(Color::BrightBlack)
		.debug(Color::Magenta)
		.info(Color::Green)
		.warn(Color::Yellow)
		.error(Color::Red);

	let console = fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} [{:5}] {}: {}",
				chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.chain(std::io::stdout());

	let file = fern::Dispatch::new()
		.format(|out, message, record| {
			out.finish(format_args!(
				"{} [{:5}] {}: {}",
				chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
				record.level(),
				record.target(),
				message
			))
		})
		.chain(fern::DateBased::new(
			log_dir.join("bifrost.log.").to_string_lossy().to_string(),
			"%Y-%m-%d",
		));

	fern::Dispatch::new()
		.level(level_from_str(level))
		// sqlx logs every statement at info; keep it quieter by default
		.level_for("sqlx", LevelFilter::Warn)
		.chain(console)
		.chain(file)
		.apply()?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn level_parsing_falls_back_to_info() {
		assert_eq!(level_from_str("debug"), LevelFilter::Debug);
		assert_eq!(level_from_str("WARN"), LevelFilter::Warn);
		assert_eq!(level_from_str("nonsense"), LevelFilter::Info);
	}
}
