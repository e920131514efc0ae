mod health;
mod routes;
mod server;
mod state;

pub use health::{health_snapshot, HealthSnapshot, StoreHealth};
pub use server::GatewayServer;
pub use state::AppState;
