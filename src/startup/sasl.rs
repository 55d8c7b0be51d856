//! SCRAM-SHA-256 client exchange (RFC 5802), with the `-PLUS` channel
//! binding variant bound to `tls-server-end-point`.
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorKind};

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

/// Which gs2 channel binding flag the client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelBinding {
    /// `n,,`: client does not support channel binding.
    NotSupported,
    /// `y,,`: client supports channel binding but the server did not offer
    /// the `-PLUS` mechanism.
    SupportedButNotUsed,
    /// `p=tls-server-end-point,,` with the certificate digest mixed into the
    /// `c=` attribute.
    TlsServerEndPoint(Vec<u8>),
}

impl ChannelBinding {
    fn gs2_header(&self) -> &'static str {
        match self {
            Self::NotSupported => "n,,",
            Self::SupportedButNotUsed => "y,,",
            Self::TlsServerEndPoint(_) => "p=tls-server-end-point,,",
        }
    }

    fn cbind_input(&self) -> Vec<u8> {
        let mut input = self.gs2_header().as_bytes().to_vec();
        if let Self::TlsServerEndPoint(data) = self {
            input.extend_from_slice(data);
        }
        input
    }
}

/// The client side of one SCRAM exchange.
///
/// ```text
/// SASLInitialResponse{ n,,n=<user>,r=<client-nonce> }
///   <- SASLContinue{ r=<nonce>,s=<salt>,i=<iterations> }
/// SASLResponse{ c=<cbind>,r=<nonce>,p=<proof> }
///   <- SASLFinal{ v=<server-signature> }
/// ```
pub struct ScramClient {
    password: String,
    channel_binding: ChannelBinding,
    client_nonce: String,
    client_first_bare: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(user: &str, password: &str, channel_binding: ChannelBinding) -> Self {
        let mut nonce_bytes = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        Self::with_nonce(user, password, channel_binding, &BASE64.encode(nonce_bytes))
    }

    fn with_nonce(
        user: &str,
        password: &str,
        channel_binding: ChannelBinding,
        nonce: &str,
    ) -> Self {
        // RFC 5802: escape '=' as '=3D' and ',' as '=2C' in the user name.
        // Postgres ignores the name here and takes it from the startup
        // message, but the attribute must still be well formed.
        let user = user.replace('=', "=3D").replace(',', "=2C");
        Self {
            password: password.to_string(),
            channel_binding,
            client_nonce: nonce.to_string(),
            client_first_bare: format!("n={user},r={nonce}"),
            auth_message: None,
            salted_password: None,
        }
    }

    /// `client-first-message` for `SASLInitialResponse`.
    pub fn client_first(&self) -> Vec<u8> {
        format!("{}{}", self.channel_binding.gs2_header(), self.client_first_bare).into_bytes()
    }

    /// Digest the `server-first-message`, producing the
    /// `client-final-message` for `SASLResponse`.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, Error> {
        let server_first = std::str::from_utf8(server_first)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations: Option<u32> = None;
        for attr in server_first.split(',') {
            if let Some(value) = attr.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = attr.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| auth_failed())?);
            } else if let Some(value) = attr.strip_prefix("i=") {
                iterations = Some(value.parse().map_err(|_| auth_failed())?);
            }
        }

        let nonce = nonce.ok_or_else(auth_failed)?;
        let salt = salt.ok_or_else(auth_failed)?;
        let iterations = iterations.filter(|i| *i > 0).ok_or_else(auth_failed)?;

        // the server nonce must extend ours, otherwise someone is replaying
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(auth_failed());
        }

        let salted_password =
            pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(self.password.as_bytes(), &salt, iterations);
        self.salted_password = Some(salted_password);

        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let cbind = BASE64.encode(self.channel_binding.cbind_input());
        let without_proof = format!("c={cbind},r={nonce}");
        let auth_message = format!(
            "{},{server_first},{without_proof}",
            self.client_first_bare,
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.auth_message = Some(auth_message);

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)).into_bytes())
    }

    /// Verify the `v=` server signature of the `server-final-message`.
    ///
    /// A mismatch means the server never knew the password; authentication
    /// fails locally even though the server accepted.
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<(), Error> {
        let server_final = std::str::from_utf8(server_final)?;
        let signature = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(auth_failed)?;
        let signature = BASE64.decode(signature).map_err(|_| auth_failed())?;

        let (Some(salted_password), Some(auth_message)) =
            (&self.salted_password, &self.auth_message)
        else {
            return Err(auth_failed());
        };

        let server_key = hmac_sha256(salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());

        if expected[..] != signature[..] {
            return Err(auth_failed());
        }
        Ok(())
    }
}

/// Pick the mechanism from the server's offer, preferring the channel bound
/// variant when the transport can produce binding data.
pub fn select_mechanism<'a, I>(
    offered: I,
    channel_binding: Option<Vec<u8>>,
    is_tls: bool,
) -> Option<(&'static str, ChannelBinding)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut plain = false;
    let mut plus = false;
    for mechanism in offered {
        match mechanism {
            SCRAM_SHA_256 => plain = true,
            SCRAM_SHA_256_PLUS => plus = true,
            _ => {}
        }
    }

    match (plus, channel_binding) {
        (true, Some(data)) => Some((SCRAM_SHA_256_PLUS, ChannelBinding::TlsServerEndPoint(data))),
        _ if plain && is_tls => Some((SCRAM_SHA_256, ChannelBinding::SupportedButNotUsed)),
        _ if plain => Some((SCRAM_SHA_256, ChannelBinding::NotSupported)),
        _ => None,
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn auth_failed() -> Error {
    ErrorKind::InvalidPassword.into()
}

#[cfg(test)]
mod test {
    use super::*;

    // RFC 7677 SCRAM-SHA-256 test vector.
    const USER: &str = "user";
    const PASS: &str = "pencil";
    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &[u8] =
        b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const SERVER_FINAL: &[u8] = b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn rfc7677_exchange() {
        let mut scram =
            ScramClient::with_nonce(USER, PASS, ChannelBinding::NotSupported, NONCE);
        assert_eq!(
            scram.client_first(),
            b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec(),
        );

        let client_final = scram.client_final(SERVER_FIRST).unwrap();
        assert_eq!(
            String::from_utf8(client_final).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=",
        );

        scram.verify_server_final(SERVER_FINAL).unwrap();
    }

    #[test]
    fn bad_server_signature_is_invalid_password() {
        let mut scram =
            ScramClient::with_nonce(USER, PASS, ChannelBinding::NotSupported, NONCE);
        scram.client_final(SERVER_FIRST).unwrap();
        let err = scram
            .verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidPassword));
    }

    #[test]
    fn nonce_must_extend_client_nonce() {
        let mut scram =
            ScramClient::with_nonce(USER, PASS, ChannelBinding::NotSupported, NONCE);
        let err = scram
            .client_final(b"r=completely-different,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidPassword));
    }

    #[test]
    fn username_is_escaped() {
        let scram =
            ScramClient::with_nonce("a=b,c", PASS, ChannelBinding::NotSupported, NONCE);
        let first = String::from_utf8(scram.client_first()).unwrap();
        assert!(first.starts_with("n,,n=a=3Db=2Cc,r="));
    }

    #[test]
    fn mechanism_selection() {
        let offered = [SCRAM_SHA_256, SCRAM_SHA_256_PLUS];

        let (name, binding) = select_mechanism(offered, Some(vec![1, 2]), true).unwrap();
        assert_eq!(name, SCRAM_SHA_256_PLUS);
        assert!(matches!(binding, ChannelBinding::TlsServerEndPoint(_)));

        let (name, binding) = select_mechanism(offered, None, true).unwrap();
        assert_eq!(name, SCRAM_SHA_256);
        assert_eq!(binding, ChannelBinding::SupportedButNotUsed);

        let (name, binding) = select_mechanism([SCRAM_SHA_256], None, false).unwrap();
        assert_eq!(name, SCRAM_SHA_256);
        assert_eq!(binding, ChannelBinding::NotSupported);

        assert!(select_mechanism(["OTHER"], None, false).is_none());
    }

    #[test]
    fn plus_changes_cbind_attribute() {
        let mut scram = ScramClient::with_nonce(
            USER,
            PASS,
            ChannelBinding::TlsServerEndPoint(vec![0xAB]),
            NONCE,
        );
        assert!(scram.client_first().starts_with(b"p=tls-server-end-point,,"));
        let client_final = scram.client_final(SERVER_FIRST).unwrap();
        let text = String::from_utf8(client_final).unwrap();
        let expected_c = BASE64.encode(b"p=tls-server-end-point,,\xAB");
        assert!(text.starts_with(&format!("c={expected_c},")));
    }
}
