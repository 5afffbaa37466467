//! uod - Ultima Online world server core
//!
//! A single world actor owns every piece of mutable game state. Network
//! sessions run their own read and write tasks and talk to the world only
//! through a bounded request queue.

// ============================================
// Server plumbing
// ============================================

/// Server configuration (YAML)
pub mod config;
/// Logical clock and the `Server` aggregate (listeners, lifecycle)
pub mod core;
/// Framing, Huffman compression, blacklist and connect throttle
pub mod network;
/// Typed client/server packets and the packet length table
pub mod protocol;
/// Per-connection sessions and the session registry
pub mod session;
/// Login-server and game-server handshakes run inside a session's read task
pub mod servers;

// ============================================
// Simulation
// ============================================

/// Collaborators the world drives: objects, accounts, templates, timers, map
pub mod game;
/// The world actor: request queue, tick loop, update batching
pub mod world;
/// Save archives and the concurrent snapshot protocol
pub mod save;
