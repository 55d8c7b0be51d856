//! Startup phase: encryption negotiation, authentication, parameter
//! absorption.
//!
//! <https://www.postgresql.org/docs/17/protocol-flow.html#PROTOCOL-FLOW-START-UP>
mod password;
pub mod sasl;

pub use password::md5_password;

use crate::{
    Error, Result,
    connection::{Config, GssEncMode, SslMode},
    error::{ErrorKind, UnsupportedAuth},
    protocol::{
        BackendMessage,
        backend::{Authentication, BackendKeyData},
        frontend,
    },
    stream::{PgStream, UpgradeReply},
    transport::{PgTransport, PgTransportExt},
};

/// Startup phase successful response.
#[derive(Debug)]
pub struct StartupOutcome {
    /// Key data for `CancelRequest`; practically always present, but the
    /// protocol allows a server to send none.
    pub key_data: Option<BackendKeyData>,
}

/// Open the byte stream to one host and negotiate encryption per the
/// configured `gssEncMode` and `sslmode`.
pub async fn open_stream(config: &Config, host: &str, port: u16) -> Result<PgStream> {
    let mut stream = PgStream::connect(host, port).await?;

    // GSS encryption is probed ahead of TLS, mirroring the server's own
    // preference order.
    match config.gss_enc_mode() {
        GssEncMode::Prefer | GssEncMode::Require => {
            let (returned, reply) = stream.request_gss_enc().await?;
            stream = returned;
            match reply {
                // The negotiation byte is driven here, but wrapping the
                // stream is the provider's business; without one the
                // accepted upgrade cannot be used.
                UpgradeReply::Accepted => return Err(ErrorKind::GssEncNotSupported.into()),
                UpgradeReply::Refused if config.gss_enc_mode() == GssEncMode::Require => {
                    return Err(ErrorKind::GssEncNotSupported.into());
                }
                UpgradeReply::Refused => {}
            }
        }
        GssEncMode::Disable | GssEncMode::Allow => {}
    }

    let request_tls = matches!(
        config.ssl_mode(),
        SslMode::Prefer | SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull,
    );
    let require_tls = matches!(
        config.ssl_mode(),
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull,
    );

    if request_tls {
        match config.tls_connector() {
            Some(connector) => {
                let (returned, reply) = stream.request_tls(connector, host).await?;
                stream = returned;
                if reply == UpgradeReply::Refused && require_tls {
                    return Err(ErrorKind::SslNotSupported.into());
                }
            }
            None if require_tls => return Err(ErrorKind::SslNotSupported.into()),
            None => {}
        }
    }

    Ok(stream)
}

/// Perform the startup message and drive the authentication sub state
/// machine until the server reports `ReadyForQuery`.
pub async fn startup(stream: &mut PgStream, config: &Config) -> Result<StartupOutcome> {
    crate::common::span!("startup");

    let mut params: Vec<(&str, &str)> = vec![
        ("client_encoding", "UTF8"),
        ("DateStyle", "ISO"),
        ("extra_float_digits", "3"),
    ];
    if let Some(timezone) = config.timezone() {
        params.push(("TimeZone", timezone));
    }

    stream.send_startup(frontend::Startup {
        user: config.user(),
        database: Some(config.database()),
        application_name: config.application_name(),
        options: config.options(),
        replication: config.replication(),
        params: &params,
    });
    stream.flush().await?;

    authenticate(stream, config).await?;

    // After having received AuthenticationOk, the frontend must wait for
    // further messages from the server: ParameterStatus (absorbed by the
    // stream), BackendKeyData, and finally ReadyForQuery.
    let mut key_data = None;
    loop {
        match stream.recv::<BackendMessage>().await? {
            BackendMessage::ReadyForQuery(_) => break,
            BackendMessage::BackendKeyData(new_key_data) => key_data = Some(new_key_data),
            // minor version downgrade is acceptable, the server picked one
            // it supports
            BackendMessage::NegotiateProtocolVersion(_) => {}
            f => Err(f.unexpected("startup phase"))?,
        }
    }

    Ok(StartupOutcome { key_data })
}

async fn authenticate(stream: &mut PgStream, config: &Config) -> Result<()> {
    loop {
        match stream.recv::<Authentication>().await? {
            Authentication::Ok => return Ok(()),
            Authentication::CleartextPassword => {
                stream.send(frontend::PasswordMessage { password: config.password() });
                stream.flush().await?;
            }
            Authentication::MD5Password { salt } => {
                let hash = md5_password(config.user(), config.password(), salt);
                stream.send(frontend::PasswordMessage { password: &hash });
                stream.flush().await?;
            }
            Authentication::SASL { mechanisms } => {
                sasl_exchange(stream, config, &mechanisms).await?;
            }
            Authentication::GSS | Authentication::SSPI => {
                // the exchange consumes the final AuthenticationOk itself
                gss_exchange(stream, config).await?;
                return Ok(());
            }
            Authentication::GSSContinue { .. } => {
                return Err(unsupported("GSS continuation without a context"));
            }
            Authentication::KerberosV5 => return Err(unsupported("KerberosV5")),
            Authentication::ScmCredential => return Err(unsupported("SCMCredential")),
            Authentication::SASLContinue { .. } | Authentication::SASLFinal { .. } => {
                return Err(unsupported("SASL continuation without an exchange"));
            }
        }
    }
}

async fn sasl_exchange(
    stream: &mut PgStream,
    config: &Config,
    mechanisms: &bytes::Bytes,
) -> Result<()> {
    let offered = Authentication::sasl_mechanisms(mechanisms);
    let Some((mechanism, binding)) =
        sasl::select_mechanism(offered, stream.channel_binding(), stream.is_tls())
    else {
        let offered = Authentication::sasl_mechanisms(mechanisms)
            .collect::<Vec<_>>()
            .join(", ");
        return Err(unsupported(offered));
    };

    let mut scram = sasl::ScramClient::new(config.user(), config.password(), binding);

    let first = scram.client_first();
    stream.send(frontend::SaslInitialResponse { mechanism, response: &first });
    stream.flush().await?;

    let data = match stream.recv::<Authentication>().await? {
        Authentication::SASLContinue { data } => data,
        f => return Err(unexpected_auth(f)),
    };

    let client_final = scram.client_final(&data)?;
    stream.send(frontend::SaslResponse { data: &client_final });
    stream.flush().await?;

    let data = match stream.recv::<Authentication>().await? {
        Authentication::SASLFinal { data } => data,
        f => return Err(unexpected_auth(f)),
    };
    scram.verify_server_final(&data)?;

    Ok(())
}

async fn gss_exchange(stream: &mut PgStream, config: &Config) -> Result<()> {
    let Some(provider) = config.gss_provider() else {
        return Err(unsupported("GSSAPI/SSPI"));
    };

    let spn = format!("postgres@{}", config.host());
    let mut context = provider.new_context(&spn)?;

    // the client speaks first
    if let Some(token) = context.step(&[])? {
        stream.send(frontend::GssResponse { data: &token });
        stream.flush().await?;
    }

    loop {
        match stream.recv::<Authentication>().await? {
            Authentication::Ok => return Ok(()),
            Authentication::GSSContinue { data } => {
                if let Some(token) = context.step(&data)? {
                    stream.send(frontend::GssResponse { data: &token });
                    stream.flush().await?;
                }
            }
            f => return Err(unexpected_auth(f)),
        }
    }
}

fn unsupported(mechanism: impl Into<String>) -> Error {
    UnsupportedAuth { mechanism: mechanism.into() }.into()
}

fn unexpected_auth(_auth: Authentication) -> Error {
    crate::protocol::ProtocolError::unexpected_phase(Authentication::MSGTYPE, "authentication")
        .into()
}
