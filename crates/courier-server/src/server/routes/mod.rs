// Route modules for Courier Server API
pub mod presence; // Who is online
pub mod session; // Anonymous sign-in and self-identity
pub mod websocket; // Relay channel upgrade
