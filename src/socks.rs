use std::net::IpAddr;
use std::sync::Arc;

use fast_socks5::{
    server::{
        run_tcp_proxy, AuthMethod, AuthMethodSuccessState, DnsResolveHelper as _,
        Socks5ServerProtocol,
    },
    ReplyError, Socks5Command, SocksError,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::directory::Directory;

/// SOCKS5 username/password method code advertised during negotiation.
const USERPASS_METHOD: u8 = 0x02;

/// Upper bound on one credential line, newline excluded.
const MAX_CREDENTIAL_LINE: usize = 256;

/// Username/password authentication with a line-based encoding.
///
/// Advertises the standard method code 0x02, but the credential exchange is
/// two newline-terminated strings rather than the RFC 1929 sub-negotiation,
/// and no sub-negotiation status byte is written back. Wire-compatible only
/// with the companion client, not with generic SOCKS5 clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineUserPassAuth;

pub struct LineUserPassAuthStarted<T>(T);

#[derive(Debug)]
pub struct LineUserPassAuthSuccess<T> {
    inner: T,
    username: String,
}

impl<T: AsyncRead + AsyncWrite + Unpin> AuthMethod<T> for LineUserPassAuth {
    type StartingState = LineUserPassAuthStarted<T>;

    fn method_id(self) -> u8 {
        USERPASS_METHOD
    }

    fn new(self, inner: T) -> Self::StartingState {
        LineUserPassAuthStarted(inner)
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> LineUserPassAuthStarted<T> {
    /// Read the two credential lines and check them against the directory.
    ///
    /// Malformed input and bad credentials collapse into the same failure:
    /// the SOCKS5 layer sees a single authentication-failure outcome either
    /// way.
    pub async fn verify(
        mut self,
        directory: &Directory,
    ) -> Result<LineUserPassAuthSuccess<T>, SocksError> {
        let username = read_credential_line(&mut self.0).await?;
        let password = read_credential_line(&mut self.0).await?;

        debug!("attempting to authenticate user '{username}'");
        if directory.authenticate_user(&username, &password).await {
            Ok(LineUserPassAuthSuccess {
                inner: self.0,
                username,
            })
        } else {
            warn!("authentication failed for user '{username}'");
            Err(SocksError::AuthenticationRejected(
                "authentication failed".to_owned(),
            ))
        }
    }
}

impl<T> LineUserPassAuthSuccess<T> {
    /// The authenticated username, available to downstream relay logic.
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl<T> AuthMethodSuccessState<T> for LineUserPassAuthSuccess<T> {
    fn into_inner(self) -> T {
        self.inner
    }
}

/// Read one newline-terminated credential line.
///
/// One byte per read keeps the stream position exact: nothing past the
/// second newline may be consumed before the protocol machine takes over.
async fn read_credential_line<T: AsyncRead + Unpin>(stream: &mut T) -> Result<String, SocksError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read_exact(&mut byte).await.is_err() {
            return Err(SocksError::AuthenticationRejected(
                "malformed credential handshake".to_owned(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_CREDENTIAL_LINE {
            return Err(SocksError::AuthenticationRejected(
                "credential line too long".to_owned(),
            ));
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).map_err(|_| {
        SocksError::AuthenticationRejected("credential line is not valid UTF-8".to_owned())
    })
}

/// Accept loop for the SOCKS5 listener. One task per connection.
pub async fn serve(listener: TcpListener, directory: Arc<Directory>, request_timeout: u64) {
    loop {
        match listener.accept().await {
            Ok((socket, client_addr)) => {
                let directory = Arc::clone(&directory);
                let client_ip = client_addr.ip();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_client(socket, client_ip, directory, request_timeout).await
                    {
                        error!("SOCKS5 client error: {err:#}");
                    }
                });
            }
            Err(err) => error!("accept error: {err:?}"),
        }
    }
}

/// Negotiate auth, then hand the connection to the standard relay.
///
/// Authentication here is per connection only: no tunnel session is
/// created, no IP binding, no idle timeout. The relay's own connection
/// lifetime bounds the authorization.
async fn handle_client(
    socket: TcpStream,
    client_ip: IpAddr,
    directory: Arc<Directory>,
    request_timeout: u64,
) -> Result<(), SocksError> {
    debug!("new SOCKS5 connection from {client_ip}");

    let started = Socks5ServerProtocol::start(socket)
        .negotiate_auth(&[LineUserPassAuth])
        .await?;
    let authed = started.verify(&directory).await?;
    info!("user '{}' authenticated successfully on SOCKS5", authed.username());
    let proto = authed.finish_auth();

    let (proto, cmd, target_addr) = proto.read_command().await?.resolve_dns().await?;
    match cmd {
        Socks5Command::TCPConnect => {
            debug!("TCP connect to {target_addr}");
            run_tcp_proxy(proto, &target_addr, request_timeout, false).await?;
        }
        _ => {
            proto.reply_error(&ReplyError::CommandNotSupported).await?;
            return Err(ReplyError::CommandNotSupported.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Credential;
    use tokio::io::AsyncWriteExt;

    fn directory() -> Arc<Directory> {
        Directory::from_parts(
            vec![Credential {
                username: "alice".to_owned(),
                password: "p1".to_owned(),
            }],
            vec![],
        )
    }

    #[test]
    fn advertises_the_userpass_method_code() {
        let id =
            <LineUserPassAuth as AuthMethod<tokio::io::DuplexStream>>::method_id(LineUserPassAuth);
        assert_eq!(id, 0x02);
    }

    #[tokio::test]
    async fn accepts_valid_two_line_credentials() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"alice\np1\n").await.unwrap();

        let directory = directory();
        let authed = LineUserPassAuthStarted(server)
            .verify(&directory)
            .await
            .expect("authentication succeeds");
        assert_eq!(authed.username(), "alice");
    }

    #[tokio::test]
    async fn leaves_bytes_after_the_credentials_untouched() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"alice\np1\n\x05\x01\x00").await.unwrap();

        let directory = directory();
        let authed = LineUserPassAuthStarted(server)
            .verify(&directory)
            .await
            .expect("authentication succeeds");

        let mut inner = authed.into_inner();
        let mut rest = [0u8; 3];
        inner.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"\x05\x01\x00");
    }

    #[tokio::test]
    async fn rejects_bad_credentials() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"alice\nwrong\n").await.unwrap();

        let directory = directory();
        let result = LineUserPassAuthStarted(server).verify(&directory).await;
        assert!(matches!(
            result,
            Err(SocksError::AuthenticationRejected(_))
        ));
    }

    #[tokio::test]
    async fn rejects_truncated_credential_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"alice\n").await.unwrap();
        drop(client);

        let directory = directory();
        let result = LineUserPassAuthStarted(server).verify(&directory).await;
        assert!(matches!(
            result,
            Err(SocksError::AuthenticationRejected(_))
        ));
    }

    #[tokio::test]
    async fn rejects_oversize_credential_line() {
        let (mut client, server) = tokio::io::duplex(1024);
        let long_line = vec![b'a'; MAX_CREDENTIAL_LINE + 10];
        client.write_all(&long_line).await.unwrap();
        client.write_all(b"\np1\n").await.unwrap();

        let directory = directory();
        let result = LineUserPassAuthStarted(server).verify(&directory).await;
        assert!(matches!(
            result,
            Err(SocksError::AuthenticationRejected(_))
        ));
    }

    #[tokio::test]
    async fn malformed_and_bad_credentials_are_one_outcome() {
        // Truncated handshake and wrong password must be indistinguishable
        // to the SOCKS5 layer.
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"alice\nwrong\n").await.unwrap();
        let directory = directory();
        let bad_creds = LineUserPassAuthStarted(server)
            .verify(&directory)
            .await
            .expect_err("must fail");

        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let truncated = LineUserPassAuthStarted(server)
            .verify(&directory)
            .await
            .expect_err("must fail");

        assert!(matches!(bad_creds, SocksError::AuthenticationRejected(_)));
        assert!(matches!(truncated, SocksError::AuthenticationRejected(_)));
    }
}
