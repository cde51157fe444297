//! One-to-one WebRTC signaling relay
//!
//! Clients connect over WebSocket, ask to be paired, and are matched at
//! random with another waiting client. One side receives the `offer` role and
//! the other the `answer` role; the relay then routes their negotiation
//! messages to each other without looking inside them.
//!
//! # Protocol
//!
//! ## Requests (client → relay)
//!
//! | message | allowed while | effect |
//! |---|---|---|
//! | `{"msg":"connect"}` | connected | replies `ok` |
//! | `{"msg":"pair"}` | ready | tries to pair, replies `ok` either way |
//! | `{"msg":"stop_pair"}` | any | leaves the pairing, replies `ok` |
//! | `{"msg":"offer", ...}` | offer role | forwarded to the partner |
//! | `{"msg":"answer", ...}` | answer role | forwarded to the partner |
//! | `{"msg":"candidate", ...}` | either role | forwarded to the partner |
//!
//! Requests sent in the wrong state get `{"msg":"error","error":"..."}`;
//! anything unrecognized is ignored.
//!
//! ## Events (relay → client)
//!
//! - `{"msg":"ok"}`
//! - `{"msg":"paired","role":"offer"|"answer"}`
//! - `{"msg":"update","online_num":7,"pairing_num":4}` after every request
//! - `{"msg":"error","error":"..."}`
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! RUST_LOG=pairbox_server=debug pairbox-server --port 3536
//!
//! # Talk to it
//! websocat ws://127.0.0.1:3536
//! {"msg":"pair"}
//! ```

#![forbid(unsafe_code)]

pub mod broadcast;
pub mod config;
pub mod error;
pub mod handler;
pub mod pairing;
pub mod server;
pub mod state;

pub use broadcast::{BroadcastCoordinator, Snapshot};
pub use config::Config;
pub use error::{ClientRequestError, SignalingError};
pub use handler::Dispatcher;
pub use pairing::{PairOutcome, Pairing, PairingEngine};
pub use server::{run, serve};
pub use state::{Endpoint, PeerId, Registry, RelayState, Status};
