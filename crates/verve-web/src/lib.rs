pub mod error;
pub mod model;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use routes::router;
pub use server::run_web_server;
pub use state::AppState;
