//! Long-running service components
//!
//! Every component here follows the same shape: a mutex-guarded queue fed
//! by non-blocking submit calls, one dedicated worker task draining the
//! queue in bounded bursts on a fixed cadence, and atomic `running` flags
//! driving start/stop.
//!
//! ```text
//!                       ┌─────────────────┐
//!   HTTP adapter ─────▶ │  IngestPipeline │ ── validate against registrar
//!                       └────────┬────────┘
//!                 ┌──────────────┼──────────────┬─────────────┐
//!                 ▼              ▼              ▼             ▼
//!          ┌────────────┐ ┌─────────────┐ ┌───────────┐ ┌───────────┐
//!          │MetricsStore│ │ StreamFanout│ │ RuleEngine│ │ Heartbeats│
//!          └────────────┘ └─────────────┘ └─────┬─────┘ └───────────┘
//!                                               │ script callbacks
//!                                    ┌──────────┴──────────┐
//!                                    ▼                     ▼
//!                          ┌──────────────────┐   ┌──────────────┐
//!                          │ ActionDispatcher │   │ AlertManager │
//!                          └──────────────────┘   └──────────────┘
//! ```
//!
//! Locks are always released before any I/O: workers copy their work set
//! to a local buffer under the lock, then process outside of it. No global
//! ordering is guaranteed across components; a reading may be broadcast
//! before it is persisted.

pub mod dispatch;
pub mod ingest;
pub mod metrics;
pub mod rules;
pub mod stream;
pub mod supervisor;
