//! Field checks shared by the user and token handlers.

use tidings_types::ValidationError;

pub const MAX_NAME_BYTES: usize = 500;
pub const MIN_PASSWORD_BYTES: usize = 8;
/// argon2 accepts more, but anything longer is almost certainly a mistake.
pub const MAX_PASSWORD_BYTES: usize = 72;
/// Activation tokens are 16 random bytes, unpadded base64.
pub const TOKEN_CHARS: usize = 22;

pub fn name(v: &mut ValidationError, name: &str) {
    v.check(!name.trim().is_empty(), "name", "must be provided");
    v.check(
        name.len() <= MAX_NAME_BYTES,
        "name",
        "must not be more than 500 bytes long",
    );
}

pub fn email(v: &mut ValidationError, email: &str) {
    v.check(!email.is_empty(), "email", "must be provided");
    v.check(looks_like_email(email), "email", "must be a valid email address");
}

pub fn password(v: &mut ValidationError, password: &str) {
    v.check(!password.is_empty(), "password", "must be provided");
    v.check(
        password.len() >= MIN_PASSWORD_BYTES,
        "password",
        "must be at least 8 bytes long",
    );
    v.check(
        password.len() <= MAX_PASSWORD_BYTES,
        "password",
        "must not be more than 72 bytes long",
    );
}

pub fn token(v: &mut ValidationError, token: &str) {
    v.check(!token.is_empty(), "token", "must be provided");
    v.check(token.len() == TOKEN_CHARS, "token", "must be 22 bytes long");
}

fn looks_like_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.rsplit_once('@') else {
        return false;
    };
    !local.is_empty()
        && !local.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
