//! `monitor` crate 入口。
//!
//! 职责：维护已确认指标的物化快照（`StateView`），并提供只读的展示输出。
//!
//! 模块分工：
//! - `snapshot`：`ConfirmedMetricsSnapshot` 数据结构。
//! - `view`：`StateView`，增量更新 + 时间点一致的读取 + 订阅推送。
//! - `render`：纯文本看板渲染。

mod render;
mod snapshot;
mod view;

pub use render::{DashboardExtras, render_dashboard};
pub use snapshot::{ConfirmedMetricsSnapshot, SharedSnapshot};
pub use view::{StateView, StateViewConfig};
