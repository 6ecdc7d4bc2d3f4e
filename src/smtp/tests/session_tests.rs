use crate::smtp::session::{run_session, SessionContext, SessionEnd};
use crate::smtp::smtp_protocol::{SmtpCapabilities, SmtpProtocol};
use crate::storage::{MemoryStorage, Storage};
use crate::webhook::{WebhookClient, WebhookRegistry};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

fn test_context(storage: Arc<dyn Storage>, enable_auth: bool) -> Arc<SessionContext> {
    Arc::new(SessionContext {
        storage,
        webhooks: Arc::new(WebhookClient::new(
            Arc::new(WebhookRegistry::new()),
            Duration::from_secs(1),
        )),
        command_timeout: Duration::from_secs(5),
        enable_auth,
        tls: None,
    })
}

struct TestClient {
    stream: BufReader<DuplexStream>,
}

impl TestClient {
    async fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
    }

    async fn expect(&mut self, expected_prefix: &str) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        assert!(
            line.starts_with(expected_prefix),
            "expected reply starting with {expected_prefix:?}, got {line:?}"
        );
        line
    }
}

/// Spawns a session over an in-memory duplex and returns the client
/// side plus the session's join handle.
fn spawn_session(
    context: Arc<SessionContext>,
    capabilities: SmtpCapabilities,
) -> (TestClient, JoinHandle<SessionEnd<DuplexStream>>) {
    let (server, client) = tokio::io::duplex(64 * 1024);
    let protocol = SmtpProtocol::new(server, capabilities);
    let handle = tokio::spawn(async move {
        run_session(protocol, &context, false).await.unwrap()
    });
    (
        TestClient {
            stream: BufReader::new(client),
        },
        handle,
    )
}

#[tokio::test]
async fn happy_path_commits_message() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("EHLO me").await;
    client.expect("250-Hello").await;
    client.expect("250 SIZE 10485760").await;
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<b@y>").await;
    client.expect("250 OK").await;
    client.send("DATA").await;
    client.expect("354 ").await;
    client.send("Subject: hi").await;
    client.send("").await;
    client.send("hello").await;
    client.send(".").await;
    client.expect("250 OK: Message accepted").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;

    assert!(matches!(session.await.unwrap(), SessionEnd::Closed));

    let emails = storage.list().await.unwrap();
    assert_eq!(emails.len(), 1);
    let email = &emails[0];
    assert_eq!(email.from, "a@x");
    assert_eq!(email.to, vec!["b@y".to_string()]);
    assert_eq!(email.subject, "hi");
    assert_eq!(email.body, "hello\r\n");
    assert_eq!(email.size, "Subject: hi\r\n\r\nhello\r\n".len() as u64);
    assert_eq!(email.id.len(), 32);
}

#[tokio::test]
async fn data_without_recipients_leaves_session_usable() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("EHLO me").await;
    client.expect("250-Hello").await;
    client.expect("250 SIZE").await;
    client.send("DATA").await;
    client.expect("503 Bad sequence of commands").await;

    // The session recovers into a normal transaction.
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}

#[tokio::test]
async fn multiple_recipients_are_stored_in_order() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("HELO me").await;
    client.expect("250 Hello").await;
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<b@y>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<c@y>").await;
    client.expect("250 OK").await;
    client.send("DATA").await;
    client.expect("354 ").await;
    client.send("hi").await;
    client.send(".").await;
    client.expect("250 OK: Message accepted").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();

    let emails = storage.list().await.unwrap();
    assert_eq!(emails[0].to, vec!["b@y".to_string(), "c@y".to_string()]);
}

#[tokio::test]
async fn rset_clears_the_envelope() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("HELO me").await;
    client.expect("250 Hello").await;
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<b@y>").await;
    client.expect("250 OK").await;
    client.send("RSET").await;
    client.expect("250 OK").await;

    // Recipients are gone; DATA needs a fresh MAIL/RCPT.
    client.send("DATA").await;
    client.expect("503 Bad sequence of commands").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();

    assert!(storage.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn dot_stuffed_body_is_unstuffed_in_storage() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("HELO me").await;
    client.expect("250 Hello").await;
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<b@y>").await;
    client.expect("250 OK").await;
    client.send("DATA").await;
    client.expect("354 ").await;
    client.send("..foo").await;
    client.send(".").await;
    client.expect("250 OK: Message accepted").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();

    let emails = storage.list().await.unwrap();
    assert_eq!(emails[0].body, ".foo\r\n");
    assert_eq!(emails[0].size, 6);
}

#[tokio::test]
async fn envelope_is_cleared_after_commit() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("HELO me").await;
    client.expect("250 Hello").await;
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<b@y>").await;
    client.expect("250 OK").await;
    client.send("DATA").await;
    client.expect("354 ").await;
    client.send("one").await;
    client.send(".").await;
    client.expect("250 OK: Message accepted").await;

    // The next transaction must start over with MAIL.
    client.send("DATA").await;
    client.expect("503 Bad sequence of commands").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}

#[tokio::test]
async fn a_second_mail_restarts_the_transaction() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("HELO me").await;
    client.expect("250 Hello").await;
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<b@y>").await;
    client.expect("250 OK").await;
    client.send("MAIL FROM:<other@x>").await;
    client.expect("250 OK").await;

    // The earlier recipient was dropped with the old envelope.
    client.send("DATA").await;
    client.expect("503 Bad sequence of commands").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}

#[tokio::test]
async fn auth_when_disabled_is_rejected() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("AUTH PLAIN").await;
    client.expect("503 Authentication not enabled").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}

#[tokio::test]
async fn auth_plain_accepts_any_credentials() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), true);
    let (mut client, session) = spawn_session(
        context,
        SmtpCapabilities {
            starttls: false,
            auth: true,
        },
    );

    client.send("AUTH PLAIN").await;
    client.expect("334 ").await;
    // base64("\0user\0password") -- accepted without validation.
    client.send("AHVzZXIAcGFzc3dvcmQ=").await;
    client.expect("235 Authentication successful").await;

    // The session is identified afterwards; MAIL is accepted.
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}

#[tokio::test]
async fn auth_login_runs_both_challenges() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), true);
    let (mut client, session) = spawn_session(
        context,
        SmtpCapabilities {
            starttls: false,
            auth: true,
        },
    );

    client.send("AUTH LOGIN").await;
    client.expect("334 VXNlcm5hbWU6").await;
    client.send("dXNlcg==").await;
    client.expect("334 UGFzc3dvcmQ6").await;
    client.send("cGFzc3dvcmQ=").await;
    client.expect("235 Authentication successful").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}

#[tokio::test]
async fn auth_without_mechanism_is_a_syntax_error() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), true);
    let (mut client, session) = spawn_session(
        context,
        SmtpCapabilities {
            starttls: false,
            auth: true,
        },
    );

    client.send("AUTH").await;
    client.expect("501 Syntax error in parameters").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}

#[tokio::test]
async fn auth_unknown_mechanism_is_unsupported() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), true);
    let (mut client, session) = spawn_session(
        context,
        SmtpCapabilities {
            starttls: false,
            auth: true,
        },
    );

    client.send("AUTH CRAM-MD5").await;
    client
        .expect("504 Authentication mechanism not supported")
        .await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}

#[tokio::test]
async fn starttls_without_keypair_is_unavailable() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("STARTTLS").await;
    client.expect("454 TLS not available").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}

#[tokio::test]
async fn starttls_with_keypair_hands_back_the_stream() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .ok();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .unwrap();

    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = Arc::new(SessionContext {
        storage,
        webhooks: Arc::new(WebhookClient::new(
            Arc::new(WebhookRegistry::new()),
            Duration::from_secs(1),
        )),
        command_timeout: Duration::from_secs(5),
        enable_auth: false,
        tls: Some(tokio_rustls::TlsAcceptor::from(Arc::new(tls_config))),
    });

    let (server, client_stream) = tokio::io::duplex(64 * 1024);
    let protocol = SmtpProtocol::new(
        server,
        SmtpCapabilities {
            starttls: true,
            auth: false,
        },
    );

    let client_task = tokio::spawn(async move {
        let mut client = TestClient {
            stream: BufReader::new(client_stream),
        };
        client.send("EHLO me").await;
        client.expect("250-Hello").await;
        client.expect("250-STARTTLS").await;
        client.expect("250 SIZE").await;
        client.send("STARTTLS").await;
        client.expect("220 Ready to start TLS").await;
        client
    });

    let end = run_session(protocol, &context, false).await.unwrap();
    assert!(matches!(end, SessionEnd::StartTls(_)));
    client_task.await.unwrap();
}

#[tokio::test]
async fn idle_connection_times_out_silently() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = Arc::new(SessionContext {
        storage,
        webhooks: Arc::new(WebhookClient::new(
            Arc::new(WebhookRegistry::new()),
            Duration::from_secs(1),
        )),
        command_timeout: Duration::from_millis(50),
        enable_auth: false,
        tls: None,
    });

    let (server, client_stream) = tokio::io::duplex(1024);
    let protocol = SmtpProtocol::new(server, SmtpCapabilities::default());

    // The client never sends anything.
    let end = run_session(protocol, &context, false).await.unwrap();
    assert!(matches!(end, SessionEnd::Closed));
    drop(client_stream);
}

#[tokio::test]
async fn connection_drop_mid_data_discards_the_message() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("HELO me").await;
    client.expect("250 Hello").await;
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<b@y>").await;
    client.expect("250 OK").await;
    client.send("DATA").await;
    client.expect("354 ").await;
    client.send("half a message").await;
    drop(client);

    assert!(matches!(session.await.unwrap(), SessionEnd::Closed));
    assert!(storage.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn oversized_payload_is_rejected_with_552() {
    let storage = Arc::new(MemoryStorage::new(10, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("HELO me").await;
    client.expect("250 Hello").await;
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<b@y>").await;
    client.expect("250 OK").await;
    client.send("DATA").await;
    client.expect("354 ").await;

    // ~10.5 MiB of 1 KiB lines, just past the advertised SIZE.
    let line = "x".repeat(1022);
    for _ in 0..10_500 {
        client.send(&line).await;
    }
    client.send(".").await;
    client.expect("552 Message size exceeds fixed maximum").await;

    // The session survives and starts a fresh transaction.
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();

    assert!(storage.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn storage_failure_replies_554_and_keeps_session() {
    // Capacity zero makes every save fail.
    let storage = Arc::new(MemoryStorage::new(0, Utc::now()));
    let context = test_context(storage.clone(), false);
    let (mut client, session) = spawn_session(context, SmtpCapabilities::default());

    client.send("HELO me").await;
    client.expect("250 Hello").await;
    client.send("MAIL FROM:<a@x>").await;
    client.expect("250 OK").await;
    client.send("RCPT TO:<b@y>").await;
    client.expect("250 OK").await;
    client.send("DATA").await;
    client.expect("354 ").await;
    client.send("hi").await;
    client.send(".").await;
    client.expect("554 Transaction failed").await;

    client.send("NOOP").await;
    client.expect("250 OK").await;
    client.send("QUIT").await;
    client.expect("221 Bye").await;
    session.await.unwrap();
}
