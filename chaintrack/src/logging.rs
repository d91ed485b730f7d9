use tracing::Level;

/// 安装全局 fmt subscriber；重复调用时静默忽略。
pub fn init_logging(level: &str) {
    let level = parse_level(level).unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}

pub fn parse_level(value: &str) -> Option<Level> {
    value.trim().to_ascii_lowercase().parse::<Level>().ok()
}
