/// tracy span，只有在 tracy client 已经启动时才生效
///
/// 未启动 client (单元测试、未开启 `profile` feature) 时为空操作。
macro_rules! profile_span {
    ($name:literal) => {
        tracy_client::Client::running().map(|client| client.span(tracy_client::span_location!($name), 0))
    };
}
