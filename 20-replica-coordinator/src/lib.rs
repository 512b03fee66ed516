//! Replication coordinator: one client request in, one reconciled reply out.
//!
//! A coordinator accepts a request per TCP connection, forwards it to a fixed
//! set of replicas in parallel, and answers with whatever its response policy
//! decides. Each module focuses on a concrete responsibility:
//!
//! - [`frame`] defines the length-prefixed request/reply protocol used on both
//!   the client-facing and the replica-facing side.
//! - [`replica`] contacts a single replica and turns every failure mode into a
//!   [`replica::ReplicaOutcome`].
//! - [`policy`] holds the response policies (first-success, quorum, all-agree)
//!   as pure functions over the outcomes received so far.
//! - [`dispatch`] fans a request out to every replica, short-circuits once the
//!   policy decides, and enforces the overall deadline.
//! - [`coordinator`] runs the accept loop and one session task per client.
//! - [`config`] validates the process-wide settings built from [`cli`].
//! - [`client`], [`replica_server`] and [`frontend`] are the one-shot client,
//!   the demo replica and the HTML front-end served by the binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod frame;
pub mod frontend;
pub mod policy;
pub mod replica;
pub mod replica_server;
