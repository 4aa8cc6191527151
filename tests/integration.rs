//! Integration tests for apiwire-client.
//!
//! A scripted device on the far end of an in-memory duplex stream plays the
//! server side of the protocol.

use std::collections::VecDeque;
use std::time::Duration;

use apiwire_client::protocol::{Sentence, SentenceBuffer};
use apiwire_client::{
    ApiError, AuthError, ChannelOptions, ChannelStatus, CommandEvent, Config, Connection, Failure,
    LoginMethod, Params,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

const CHALLENGE: &str = "0102030405060708090a0b0c0d0e0f10";
const RESPONSE: &str = "001932306863c32b4d9ee57ab94e51da82";

struct FakeDevice {
    stream: DuplexStream,
    buffer: SentenceBuffer,
    pending: VecDeque<Sentence>,
}

impl FakeDevice {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: SentenceBuffer::new(),
            pending: VecDeque::new(),
        }
    }

    /// Next sentence from the client.
    async fn recv(&mut self) -> Vec<String> {
        loop {
            if let Some(sentence) = self.pending.pop_front() {
                return sentence.into_words();
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the stream");
            self.pending.extend(self.buffer.push(&buf[..n]).unwrap());
        }
    }

    /// Next sentence, or `None` if nothing arrives within `wait`.
    async fn try_recv(&mut self, wait: Duration) -> Option<Vec<String>> {
        tokio::time::timeout(wait, self.recv()).await.ok()
    }

    async fn send(&mut self, words: &[&str]) {
        let bytes = Sentence::from_words(words.iter().copied()).encode().unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Play the challenge login for user "admin" / password "password".
    async fn accept_login(&mut self) {
        assert_eq!(self.recv().await, ["/login"]);
        let ret = format!("=ret={}", CHALLENGE);
        self.send(&["!done", &ret]).await;

        let response = format!("=response={}", RESPONSE);
        assert_eq!(self.recv().await, ["/login", "=name=admin", &response]);
        self.send(&["!done"]).await;
    }
}

async fn connect_with(config: Config) -> (Connection, FakeDevice) {
    let (client, server) = duplex(64 * 1024);
    let mut device = FakeDevice::new(server);

    let (connection, ()) = tokio::join!(
        Connection::from_stream(client, config, "admin", "password"),
        device.accept_login()
    );
    (connection.unwrap(), device)
}

async fn connect() -> (Connection, FakeDevice) {
    connect_with(Config::default()).await
}

/// Two rows then done, delivered in order on one handle.
#[tokio::test]
async fn test_end_to_end_print() {
    let (connection, mut device) = connect().await;
    let channel = connection.open_channel(Some(1)).await.unwrap();

    let mut handle = channel.write("/ip/address/print", Params::new());
    assert_eq!(device.recv().await, ["/ip/address/print", ".tag=1"]);

    device
        .send(&["!re", "=.id=*1", "=address=10.0.0.1/24", ".tag=1"])
        .await;
    device
        .send(&["!re", "=.id=*2", "=address=10.0.1.1/24", ".tag=1"])
        .await;
    device.send(&["!done", ".tag=1"]).await;

    let Some(CommandEvent::Row(first)) = handle.next_event().await else {
        panic!("expected first row");
    };
    assert_eq!(first.get(".id"), Some("*1"));

    let Some(CommandEvent::Row(second)) = handle.next_event().await else {
        panic!("expected second row");
    };
    assert_eq!(second.get(".id"), Some("*2"));

    let Some(CommandEvent::Done(rows)) = handle.next_event().await else {
        panic!("expected done");
    };
    assert_eq!(rows, vec![first, second]);
    assert_eq!(handle.next_event().await, None);
}

#[tokio::test]
async fn test_challenge_login_rejected() {
    let (client, server) = duplex(4096);
    let mut device = FakeDevice::new(server);

    let script = async {
        assert_eq!(device.recv().await, ["/login"]);
        let ret = format!("=ret={}", CHALLENGE);
        device.send(&["!done", &ret]).await;
        device.recv().await;
        device
            .send(&["!trap", "=message=invalid user name or password (6)"])
            .await;
        device.send(&["!done"]).await;
    };

    let (result, ()) = tokio::join!(
        Connection::from_stream(client, Config::default(), "admin", "wrong"),
        script
    );

    let Err(ApiError::Auth(AuthError::Rejected(trap))) = result else {
        panic!("expected rejection");
    };
    assert_eq!(trap.message(), "invalid user name or password (6)");
}

#[tokio::test]
async fn test_malformed_challenge() {
    let (client, server) = duplex(4096);
    let mut device = FakeDevice::new(server);

    let script = async {
        device.recv().await;
        device.send(&["!done", "=ret=00ff"]).await;
    };

    let (result, ()) = tokio::join!(
        Connection::from_stream(client, Config::default(), "admin", "password"),
        script
    );
    assert!(matches!(
        result,
        Err(ApiError::Auth(AuthError::MalformedChallenge { len: 2 }))
    ));
}

#[tokio::test]
async fn test_plain_login() {
    let (client, server) = duplex(4096);
    let mut device = FakeDevice::new(server);
    let config = Config::default().login_method(LoginMethod::Plain);

    let script = async {
        assert_eq!(
            device.recv().await,
            ["/login", "=name=admin", "=password=password"]
        );
        device.send(&["!done"]).await;
    };

    let (result, ()) = tokio::join!(
        Connection::from_stream(client, config, "admin", "password"),
        script
    );
    assert!(result.is_ok());
}

/// Replies interleaved across two tags reach the right handles.
#[tokio::test]
async fn test_interleaved_channels() {
    let (connection, mut device) = connect().await;
    let interfaces = connection.open_channel(None).await.unwrap();
    let routes = connection.open_channel(None).await.unwrap();
    assert_eq!((interfaces.tag(), routes.tag()), (1, 2));

    let a = interfaces.write("/interface/print", ());
    let b = routes.write("/ip/route/print", ());
    device.recv().await;
    device.recv().await;

    device.send(&["!re", "=name=ether1", ".tag=1"]).await;
    device.send(&["!re", "=dst-address=0.0.0.0/0", ".tag=2"]).await;
    device.send(&["!re", "=name=ether2", ".tag=1"]).await;
    device.send(&["!done", ".tag=2"]).await;
    device.send(&["!done", ".tag=1"]).await;

    let a_rows = a.wait().await.unwrap();
    let b_rows = b.wait().await.unwrap();

    let names: Vec<_> = a_rows.iter().filter_map(|r| r.get("name")).collect();
    assert_eq!(names, ["ether1", "ether2"]);
    assert_eq!(b_rows.len(), 1);
    assert_eq!(b_rows[0].get("dst-address"), Some("0.0.0.0/0"));
}

/// The second command only reaches the wire after the first is done.
#[tokio::test]
async fn test_channel_commands_are_sequential() {
    let (connection, mut device) = connect().await;
    let channel = connection.open_channel(None).await.unwrap();

    let first = channel.write("/system/resource/print", ());
    let second = channel.write("/system/identity/print", ());

    assert_eq!(device.recv().await, ["/system/resource/print", ".tag=1"]);
    assert_eq!(device.try_recv(Duration::from_millis(50)).await, None);

    device.send(&["!trap", "=message=busy", ".tag=1"]).await;
    assert_eq!(device.try_recv(Duration::from_millis(50)).await, None);

    device.send(&["!done", ".tag=1"]).await;
    assert_eq!(device.recv().await, ["/system/identity/print", ".tag=1"]);
    device.send(&["!done", ".tag=1"]).await;

    assert!(matches!(first.wait().await, Err(ApiError::Trap(_))));
    assert!(second.wait().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_params_and_query_words() {
    let (connection, mut device) = connect().await;
    let channel = connection.open_channel(None).await.unwrap();

    let _handle = channel.write(
        "/interface/print\n?type=ether",
        Params::new().with(".proplist", "name,mtu"),
    );

    assert_eq!(
        device.recv().await,
        ["/interface/print", "?type=ether", "=.proplist=name,mtu", ".tag=1"]
    );
}

#[tokio::test]
async fn test_duplicate_channel() {
    let (connection, _device) = connect().await;
    connection.open_channel(Some(7)).await.unwrap();

    let err = connection.open_channel(Some(7)).await.unwrap_err();
    assert!(matches!(err, ApiError::DuplicateChannel(7)));
}

/// `!fatal` fails every command and ends the connection.
#[tokio::test]
async fn test_fatal_broadcast() {
    let (connection, mut device) = connect().await;
    let one = connection.open_channel(None).await.unwrap();
    let two = connection.open_channel(None).await.unwrap();

    let running = one.write("/tool/ping", [("address", "10.0.0.1")]);
    let queued = one.write("/ip/address/print", ());
    let other = two.write("/log/print", ());
    device.recv().await;
    device.recv().await;

    device.send(&["!fatal", "out of memory"]).await;

    for handle in [running, queued, other] {
        assert!(matches!(handle.wait().await, Err(ApiError::Fatal(ref m)) if m == "out of memory"));
    }
    assert!(matches!(
        connection.wait_closed().await,
        Err(ApiError::Fatal(_))
    ));
    assert!(connection.is_closed());
}

/// Forced close cancels the running command and waits for its end.
#[tokio::test]
async fn test_forced_close_cancels() {
    let (connection, mut device) = connect().await;
    let channel = connection.open_channel(None).await.unwrap();

    let mut torch = channel.write("/tool/torch", [("interface", "ether1")]);
    device.recv().await;
    device.send(&["!re", "=tx=100", ".tag=1"]).await;
    assert!(matches!(torch.next_event().await, Some(CommandEvent::Row(_))));

    let closer = channel.clone();
    let close = tokio::spawn(async move { closer.close(true).await });

    assert_eq!(device.recv().await, ["/cancel", "=tag=1"]);
    assert_eq!(channel.status().await, ChannelStatus::Closing);

    device.send(&["!trap", "=category=2", "=message=interrupted", ".tag=1"]).await;
    device.send(&["!done", ".tag=1"]).await;
    device.send(&["!done"]).await;

    close.await.unwrap().unwrap();
    let Some(CommandEvent::Trap(trap)) = torch.next_event().await else {
        panic!("expected interrupted trap");
    };
    assert_eq!(trap.message(), "interrupted");
    assert_eq!(channel.status().await, ChannelStatus::Closed);
}

#[tokio::test]
async fn test_write_after_close() {
    let (connection, mut device) = connect().await;
    let channel = connection.open_channel(None).await.unwrap();

    let running = channel.write("/a", ());
    device.recv().await;

    let closer = channel.clone();
    let close = tokio::spawn(async move { closer.close(false).await });
    while channel.status().await != ChannelStatus::Closing {
        tokio::task::yield_now().await;
    }

    let late = channel.write("/b", ());
    device.send(&["!done", ".tag=1"]).await;

    close.await.unwrap().unwrap();
    assert!(running.wait().await.is_ok());
    assert!(matches!(late.wait().await, Err(ApiError::WriteAfterClose(1))));
    assert_eq!(device.try_recv(Duration::from_millis(50)).await, None);
}

/// A handle of a closed channel never drives the channel that reuses its tag.
#[tokio::test]
async fn test_closed_handle_after_tag_reuse() {
    let (connection, mut device) = connect().await;
    let old = connection.open_channel(None).await.unwrap();
    old.close(false).await.unwrap();

    let fresh = connection.open_channel(None).await.unwrap();
    assert_eq!(fresh.tag(), old.tag());

    let stale = old.write("/stale/command", ());
    assert!(matches!(stale.wait().await, Err(ApiError::WriteAfterClose(1))));
    assert_eq!(old.status().await, ChannelStatus::Closed);
    assert_eq!(fresh.status().await, ChannelStatus::Open);

    let own = fresh.write("/system/identity/print", ());
    assert_eq!(device.recv().await, ["/system/identity/print", ".tag=1"]);

    assert!(matches!(old.close(true).await, Err(ApiError::UnknownChannel(1))));
    assert_eq!(fresh.status().await, ChannelStatus::Running);
    assert_eq!(device.try_recv(Duration::from_millis(50)).await, None);

    device.send(&["!re", "=name=MikroTik", ".tag=1"]).await;
    device.send(&["!done", ".tag=1"]).await;
    let rows = own.wait().await.unwrap();
    assert_eq!(rows[0].get("name"), Some("MikroTik"));
}

#[tokio::test]
async fn test_zero_tag_rejected() {
    let (connection, _device) = connect().await;

    assert!(matches!(
        connection.open_channel(Some(0)).await,
        Err(ApiError::InvalidTag)
    ));
    assert_eq!(connection.open_channel(None).await.unwrap().tag(), 1);
}

/// With close-on-done the quit goes out only after both channels closed.
#[tokio::test]
async fn test_close_cascade() {
    for reverse in [false, true] {
        let (connection, mut device) = connect_with(Config::default().close_on_done(true)).await;
        let a = connection.open_channel(None).await.unwrap();
        let b = connection.open_channel(None).await.unwrap();
        let _ha = a.write("/a", ());
        let _hb = b.write("/b", ());
        device.recv().await;
        device.recv().await;

        let (first, second) = if reverse { (b, a) } else { (a, b) };
        let first_close = {
            let ch = first.clone();
            tokio::spawn(async move { ch.close(false).await })
        };
        let second_close = {
            let ch = second.clone();
            tokio::spawn(async move { ch.close(false).await })
        };
        while first.status().await != ChannelStatus::Closing
            || second.status().await != ChannelStatus::Closing
        {
            tokio::task::yield_now().await;
        }

        let done = format!(".tag={}", first.tag());
        device.send(&["!done", &done]).await;
        first_close.await.unwrap().unwrap();
        assert_eq!(device.try_recv(Duration::from_millis(50)).await, None);

        let done = format!(".tag={}", second.tag());
        device.send(&["!done", &done]).await;
        second_close.await.unwrap().unwrap();
        assert_eq!(device.recv().await, ["/quit"]);

        device.send(&["!fatal", "session terminated on request"]).await;
        connection.wait_closed().await.unwrap();
    }
}

#[tokio::test]
async fn test_close_drains_then_quits() {
    let (connection, mut device) = connect().await;
    let channel = connection.open_channel(None).await.unwrap();
    let handle = channel.write("/export", ());
    device.recv().await;

    let closer = connection.clone();
    let close = tokio::spawn(async move { closer.close(false).await });

    assert_eq!(device.try_recv(Duration::from_millis(50)).await, None);
    device.send(&["!re", "=ret=# config", ".tag=1"]).await;
    device.send(&["!done", ".tag=1"]).await;
    assert_eq!(device.recv().await, ["/quit"]);
    device.send(&["!fatal", "session terminated on request"]).await;

    close.await.unwrap().unwrap();
    let rows = handle.wait().await.unwrap();
    assert_eq!(rows[0].get("ret"), Some("# config"));
}

#[tokio::test]
async fn test_one_shot_write() {
    let (connection, mut device) = connect().await;

    let handle = connection.write("/system/clock/print", ()).await.unwrap();
    assert_eq!(device.recv().await, ["/system/clock/print", ".tag=1"]);
    device.send(&["!re", "=time=12:00:00", ".tag=1"]).await;
    device.send(&["!done", ".tag=1"]).await;
    assert_eq!(handle.wait().await.unwrap().len(), 1);

    // the one-shot channel released its tag
    let channel = connection.open_channel(None).await.unwrap();
    assert_eq!(channel.tag(), 1);
}

#[tokio::test]
async fn test_close_on_trap_option() {
    let (connection, mut device) = connect().await;
    let channel = connection
        .open_channel_with(ChannelOptions::new().close_on_trap(true))
        .await
        .unwrap();

    let failing = channel.write("/bad", ());
    let queued = channel.write("/never", ());
    device.recv().await;
    device.send(&["!trap", "=message=no such command", ".tag=1"]).await;
    device.send(&["!done", ".tag=1"]).await;

    assert!(matches!(failing.wait().await, Err(ApiError::Trap(_))));
    assert!(matches!(queued.wait().await, Err(ApiError::ChannelClosed(1))));
    assert_eq!(channel.status().await, ChannelStatus::Closed);
}

#[tokio::test]
async fn test_dropping_handles_quits() {
    let (connection, mut device) = connect().await;
    let channel = connection.open_channel(None).await.unwrap();
    drop(channel);
    drop(connection);

    assert_eq!(device.recv().await, ["/quit"]);
    device.send(&["!fatal", "session terminated on request"]).await;
}

#[tokio::test]
async fn test_peer_hangup_fails_commands() {
    let (connection, mut device) = connect().await;
    let channel = connection.open_channel(None).await.unwrap();
    let mut handle = channel.write("/a", ());
    device.recv().await;
    drop(device);

    let Some(CommandEvent::Error(Failure::Transport(_))) = handle.next_event().await else {
        panic!("expected transport failure");
    };
    assert!(matches!(
        connection.wait_closed().await,
        Err(ApiError::Transport(_))
    ));
}

#[tokio::test]
async fn test_unknown_reply_type_is_fatal() {
    let (connection, mut device) = connect().await;
    device.send(&["!bogus"]).await;

    assert!(matches!(
        connection.wait_closed().await,
        Err(ApiError::Protocol(_))
    ));
}
