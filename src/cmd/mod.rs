//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `cascade`  | `Validate`, `Species` |
//! | `winners`  | `Winners`        |
//! | `trace`    | `Trace`          |
//! | `config`   | `Config`         |

pub mod cascade;
pub mod config;
pub mod trace;
pub mod winners;

pub use cascade::{cmd_species, cmd_validate};
pub use config::cmd_config;
pub use trace::cmd_trace;
pub use winners::cmd_winners;
