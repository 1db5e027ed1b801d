// Build-time identity from Cargo.toml; sent as User-Agent and served on the relay's GET /version.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const NAME: &str = env!("CARGO_PKG_NAME");

/// `indocker-sync/<version>`.
pub fn user_agent() -> String {
    format!("{}/{}", NAME, VERSION)
}
