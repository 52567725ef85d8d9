use secrecy::SecretString;

pub mod server;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        signing_key: SecretString,
        frontend_url: String,
        totp_issuer: String,
        token_ttl_seconds: i64,
    },
}
