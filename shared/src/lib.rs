//! Wire types shared between the relay server and browser clients.
//!
//! TypeScript bindings are generated with `ts-rs` when the tests run.

pub mod protocol;
pub mod vec3;
