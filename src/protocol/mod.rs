//! PostgreSQL frontend/backend wire protocol, version 3.
//!
//! `frontend` holds client → server message writers, `backend` the
//! server → client parsers. `codec` has the shared primitives. Everything
//! here is sans-I/O: writers append to a `Vec<u8>`, parsers borrow from a
//! payload slice.

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;
