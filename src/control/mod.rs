//! Local control interface
//!
//! HTTP/JSON surface for the operator panel. Runs are started and cancelled
//! here, and run history can be pulled as CSV.
//!
//! # Endpoints
//!
//! | Method | Path                          | Description                      |
//! |--------|-------------------------------|----------------------------------|
//! | GET    | `/api/health`                 | Liveness and uptime              |
//! | GET    | `/api/status`                 | Runs, clock and session at once  |
//! | POST   | `/api/runs`                   | Configure a target and start     |
//! | GET    | `/api/runs`                   | All runs                         |
//! | GET    | `/api/runs/{id}?limit=N`      | One run with its last N attempts |
//! | POST   | `/api/runs/{id}/cancel`       | Cancel a run                     |
//! | GET    | `/api/clock`                  | Current offset and staleness     |
//! | POST   | `/api/clock/measure`          | Re-measure the offset            |
//! | GET    | `/api/session`                | Session freshness                |
//! | POST   | `/api/session/check`          | Validate against the endpoint    |
//! | PUT    | `/api/session/token`          | Install a new token              |
//! | GET    | `/api/export/attempts.csv`    | Attempt history                  |
//! | GET    | `/api/export/samples.csv`     | Poll samples                     |
//! | POST   | `/api/notifications/test`     | Send a test notification         |
//! | GET    | `/metrics`                    | Prometheus metrics               |

pub mod api;
pub mod server;

pub use api::{create_router, ApiResponse, ErrorResponse};
pub use server::{AppState, ControlServer, ServerError};
