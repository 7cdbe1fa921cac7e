//! Concrete IO backends for `fetchgate`: the Encoding Repair pipeline,
//! the Proxy Pool, the browser-driver subprocess, and the SQLite-backed
//! response history store.
//!
//! `fetchgate-core` defines the shapes; everything here does the actual
//! network, process, and disk IO behind those shapes so
//! `fetchgate-server` can stay focused on orchestration and HTTP.

pub mod driver;
pub mod encoding;
pub mod history;
pub mod proxy;
pub mod shellout;
