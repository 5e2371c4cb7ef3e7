use std::io::Write;

use env_logger::fmt::Formatter;
use log::{Level, LevelFilter, Record};

pub fn init_log() {
    init_log_with_level(LevelFilter::Info);
}

/// 设置了 `RUST_LOG` 时，其中的过滤规则覆盖 `level`
pub fn init_log_with_level(level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.format(format_record).filter(None, level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn level_color(level: Level) -> Option<anstyle::Color> {
    let color = match level {
        Level::Info => anstyle::AnsiColor::Green,
        Level::Warn => anstyle::AnsiColor::Yellow,
        Level::Error => anstyle::AnsiColor::Red,
        _ => return None,
    };
    Some(anstyle::Color::Ansi(color))
}

/// `[时间] 级别 [文件:行号] 内容`
fn format_record(buf: &mut Formatter, record: &Record) -> std::io::Result<()> {
    let mut level_style = buf.default_level_style(record.level());
    if let Some(color) = level_color(record.level()) {
        level_style = level_style.fg_color(Some(color));
    }
    let grey_style = anstyle::Style::new().fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));

    let line = record.line().unwrap_or(!0);
    // windows 和 unix 的路径分隔符都要处理
    let file = record.file().unwrap_or("").rsplit(['/', '\\']).next().unwrap_or("");
    let time = chrono::Local::now().format("%H:%M:%S%.3f");
    let level = record.level();

    writeln!(
        buf,
        "{level_style}[{time}] {level:<5}{level_style:#} {grey_style}[{file}:{line}]{grey_style:#} {}",
        record.args()
    )
}
