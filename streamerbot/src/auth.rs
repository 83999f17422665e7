use base64ct::Encoding;
use sha2::Digest;

/// Where the current session stands with respect to authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStatus {
    /// The server did not ask for credentials.
    #[default]
    NotRequired,
    /// A challenge was received and has not been answered yet.
    Pending,
    Authenticated,
}

/// Answers a Hello challenge.
///
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn authentication_secret(password: &str, salt: &str, challenge: &str) -> String {
    let secret = sha2::Sha256::new()
        .chain_update(password)
        .chain_update(salt)
        .finalize();
    let secret = base64ct::Base64::encode_string(&secret);
    let secret = sha2::Sha256::new()
        .chain_update(&secret)
        .chain_update(challenge)
        .finalize();
    base64ct::Base64::encode_string(&secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_padded_base64_of_a_digest() {
        let secret = authentication_secret("hunter2", "salt", "challenge");
        assert_eq!(secret.len(), 44);
        assert!(secret.ends_with('='));
        assert!(base64ct::Base64::decode_vec(&secret).is_ok_and(|raw| raw.len() == 32));
    }

    #[test]
    fn every_input_feeds_the_secret() {
        let base = authentication_secret("pw", "salt", "challenge");
        assert_eq!(base, authentication_secret("pw", "salt", "challenge"));
        assert_ne!(base, authentication_secret("pw2", "salt", "challenge"));
        assert_ne!(base, authentication_secret("pw", "salt2", "challenge"));
        assert_ne!(base, authentication_secret("pw", "salt", "challenge2"));
    }

    #[test]
    fn password_and_salt_are_concatenated() {
        // Only the concatenation matters for the inner digest.
        assert_eq!(
            authentication_secret("pass", "word", "c"),
            authentication_secret("pas", "sword", "c")
        );
    }
}
