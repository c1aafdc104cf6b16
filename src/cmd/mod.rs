//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `config` | `Config`         |
//! | `routes` | `Routes`         |

pub mod config;
pub mod routes;
pub mod run;

pub use config::cmd_config;
pub use routes::cmd_routes;
pub use run::cmd_run;
