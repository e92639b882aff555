// 库入口：供二进制与集成测试复用的渠道适配层。
pub mod api;
pub mod channels;
pub mod config;
pub mod config_store;
pub mod shutdown;
pub mod state;

pub use api::build_router;
pub use state::AppState;
