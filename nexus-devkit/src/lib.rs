/*!
# Nexus DevKit - HTTP stubs for kernel tests

In-process stand-ins for the services the kernel talks to:
- `PveStub`: programmable Proxmox VE API (nodes, status, storage, guests,
  ticket login, per-path failure injection)
- `GrafanaStub`: health endpoint that fails N times, datasource and dashboard
  endpoints recording every call
- `fixtures`: JSON payload builders in the Proxmox wire shape

Every stub binds `127.0.0.1:0` and is torn down when its `StubServer` drops.
*/

pub mod fixtures;
pub mod grafana_stub;
pub mod pve_stub;
pub mod test_utils;

pub use grafana_stub::GrafanaStub;
pub use pve_stub::PveStub;
pub use test_utils::{init_tracing, serve_router, StubServer};
