//! Write tokens.
//!
//! A token proves that a writer receives traffic at its claimed source
//! address: it is handed out in `get_peers`/`get_item` replies and must
//! be echoed back on any write. Tokens are the first four bytes of
//! `SHA1(ip ‖ secret ‖ target)` under a rolling two-epoch secret, so a
//! token stays valid for at least one and at most two rotations.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use sha1::{Digest, Sha1};

pub const TOKEN_LEN: usize = 4;

pub struct TokenAuthority {
    // current and previous epoch
    secrets: [u64; 2],
}

impl TokenAuthority {
    pub fn new() -> Self {
        Self {
            secrets: [rand::random(), rand::random()],
        }
    }

    /// Token for a writer at `addr` targeting `target`.
    pub fn generate(&self, addr: &SocketAddr, target: &[u8; 20]) -> Bytes {
        make_token(addr.ip(), self.secrets[0], target)
    }

    /// Accepts a token minted under either the current or previous secret.
    pub fn verify(&self, token: &[u8], target: &[u8; 20], addr: &SocketAddr) -> bool {
        if token.len() != TOKEN_LEN {
            return false;
        }
        self.secrets
            .iter()
            .any(|s| make_token(addr.ip(), *s, target).as_ref() == token)
    }

    /// Advances the epoch: previous takes the current secret, the current
    /// one is drawn fresh.
    pub fn rotate(&mut self) {
        self.secrets[1] = self.secrets[0];
        self.secrets[0] = rand::random();
    }
}

impl Default for TokenAuthority {
    fn default() -> Self {
        Self::new()
    }
}

fn make_token(ip: IpAddr, secret: u64, target: &[u8; 20]) -> Bytes {
    let mut h = Sha1::new();
    match ip {
        IpAddr::V4(v4) => h.update(v4.octets()),
        IpAddr::V6(v6) => h.update(v6.octets()),
    }
    h.update(secret.to_be_bytes());
    h.update(target);
    Bytes::copy_from_slice(&h.finalize()[..TOKEN_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 6881)
    }

    #[test]
    fn roundtrip() {
        let auth = TokenAuthority::new();
        let target = [0xaa; 20];
        let token = auth.generate(&addr(2), &target);
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(auth.verify(&token, &target, &addr(2)));
    }

    #[test]
    fn bound_to_address_and_target() {
        let auth = TokenAuthority::new();
        let target = [0xaa; 20];
        let token = auth.generate(&addr(2), &target);
        assert!(!auth.verify(&token, &target, &addr(3)));
        assert!(!auth.verify(&token, &[0xbb; 20], &addr(2)));
    }

    #[test]
    fn survives_one_rotation_not_two() {
        let mut auth = TokenAuthority::new();
        let target = [0xaa; 20];
        let token = auth.generate(&addr(2), &target);

        auth.rotate();
        assert!(auth.verify(&token, &target, &addr(2)));

        auth.rotate();
        assert!(!auth.verify(&token, &target, &addr(2)));
    }

    #[test]
    fn wrong_length_rejected() {
        let auth = TokenAuthority::new();
        let target = [0xaa; 20];
        assert!(!auth.verify(b"", &target, &addr(2)));
        assert!(!auth.verify(b"abcde", &target, &addr(2)));
    }

    #[test]
    fn token_ignores_source_port() {
        let auth = TokenAuthority::new();
        let target = [0xaa; 20];
        let token = auth.generate(&addr(2), &target);
        let other_port = SocketAddr::new(addr(2).ip(), 9999);
        assert!(auth.verify(&token, &target, &other_port));
    }
}
