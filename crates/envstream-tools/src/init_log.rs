use std::io::Write;

/// 日志过滤的环境变量，语法与 `RUST_LOG` 相同
pub const LOG_ENV: &str = "ENVSTREAM_LOG";

/// 安装全局 logger，默认 Info 级别，可通过 `ENVSTREAM_LOG` 覆盖
///
/// 只应由可执行文件调用；库代码只使用 `log` 宏。
pub fn init_log() {
    init_log_with_default("info");
}

/// 与 [`init_log`] 相同，但可以指定没有设置环境变量时的默认过滤规则
///
/// 重复调用是安全的：第二次安装会失败并被忽略。
pub fn init_log_with_default(default_filter: &str) {
    let env = env_logger::Env::new().filter_or(LOG_ENV, default_filter);

    let result = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            let level_style = level_style(buf.default_level_style(record.level()), record.level());
            let location_style = anstyle::Style::new().fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));

            let file = record.file().unwrap_or("").rsplit(['/', '\\']).next().unwrap_or("");
            let line = record.line().unwrap_or(0);
            let time = chrono::Local::now().format("%H:%M:%S%.3f");
            let level = record.level();

            writeln!(
                buf,
                "{level_style}[{time}] {level:<5}{level_style:#} {location_style}[{file}:{line}]{location_style:#} {}",
                record.args()
            )
        })
        .try_init();

    if result.is_err() {
        log::debug!("logger already installed, keep the existing one");
    }
}

fn level_style(base: anstyle::Style, level: log::Level) -> anstyle::Style {
    let color = match level {
        log::Level::Error => anstyle::AnsiColor::Red,
        log::Level::Warn => anstyle::AnsiColor::Yellow,
        log::Level::Info => anstyle::AnsiColor::Green,
        log::Level::Debug => anstyle::AnsiColor::Blue,
        log::Level::Trace => return base,
    };
    base.fg_color(Some(anstyle::Color::Ansi(color)))
}
