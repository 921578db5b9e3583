// Control surface exposed to the control plane.
//
// server.rs : tool handler mapping each verb onto the supervisor
// audit.rs  : JSON-lines record of every control request

pub mod audit;
pub mod server;
