//! tandemd - reliable peer messaging and replicated document sync.
//!
//! Several processes (one host, several clients) share a live document with
//! no central server beyond an optional dumb relay. The stack, bottom-up:
//!
//! - [`transport`]: drivers with at-least-once, unordered, duplicate-prone
//!   delivery (websocket relay client, in-memory test hub).
//! - [`connection`]: one multiplexed connection over a driver. Named
//!   actions, live peer set, round-trip probes.
//! - [`reliable`]: per-(sender, receiver, action) ordered, exactly-once
//!   application via sequence numbers, acks, and retransmission.
//! - [`doc`]: CRDT document replication over the reliable `doc` channel.
//! - [`session`]: host/client bootstrap with a one-shot snapshot.
//! - [`relay`]: the dumb message switch the websocket driver talks to.

pub mod config;
pub mod connection;
pub mod doc;
pub mod error;
pub mod http;
pub mod metrics;
pub mod relay;
pub mod reliable;
pub mod session;
pub mod telemetry;
pub mod transport;
