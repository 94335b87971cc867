use std::io::Write;
use std::sync::Once;

static INIT_LOG: Once = Once::new();

/// 初始化全局 logger
///
/// 可以重复调用，只有第一次调用生效。测试代码中每个 case 都会调用一次。
///
/// 默认等级为 Info，可以通过 `RUST_LOG` 覆盖（例如 `RUST_LOG=truvis_asset=trace`）。
pub fn init_log() {
    INIT_LOG.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder
            .format(|buf, record| {
                let info_style = buf
                    .default_level_style(log::Level::Info)
                    .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green)));
                let warn_style = buf
                    .default_level_style(log::Level::Warn)
                    .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow)));
                let error_style = buf
                    .default_level_style(log::Level::Error)
                    .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red)));

                let level_style = match record.level() {
                    log::Level::Info => info_style,
                    log::Level::Warn => warn_style,
                    log::Level::Error => error_style,
                    _ => buf.default_level_style(record.level()),
                };
                let grey_style = info_style.fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));
                let black_style = info_style.fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(75, 75, 75))));

                let line = record.line().unwrap_or(!0);
                let file = record.file().unwrap_or("").rsplit(['\\', '/']).next().unwrap_or("");
                let time = chrono::Local::now().format("%H:%M:%S%.3f");
                let level = record.level();
                // streamer 线程和调用线程的日志会交错，打印线程名方便区分
                let thread = std::thread::current();
                let thread_name = thread.name().unwrap_or("?");

                writeln!(
                    buf,
                    "{level_style}[{time}] {level}{level_style:#} {grey_style}[{thread_name}][{file}:{line}]{grey_style:#} \
                     {black_style}{}{black_style:#}",
                    record.args()
                )
            })
            .filter(None, log::LevelFilter::Info)
            .parse_default_env()
            .is_test(cfg!(test));

        // 其他 logger 已经安装时忽略
        let _ = builder.try_init();
    });
}
