//! Tests d'intégration du plan de contrôle : un serveur réel sur un
//! socket temporaire, un client ligne à ligne.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use ondeaudio::{Jitter, SampleFormat, ScatterJitter};
use ondecatalog::{Catalog, CatalogMedia};
use ondecontrol::ControlServer;
use ondeplayer::Player;
use ondestream::Volume;

struct TestBed {
    client: BufReader<UnixStream>,
    stop: CancellationToken,
    _dir: tempfile::TempDir,
}

impl TestBed {
    async fn request(&mut self, line: &str) -> Value {
        self.client
            .get_mut()
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        // Saute les notifications éventuelles pour trouver la réponse.
        loop {
            let mut reply = String::new();
            self.client.read_line(&mut reply).await.unwrap();
            let value: Value = serde_json::from_str(&reply).unwrap();
            if value.get("method").is_none() {
                return value;
            }
        }
    }

    async fn next_notification(&mut self) -> Value {
        loop {
            let mut line = String::new();
            self.client.read_line(&mut line).await.unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            if value.get("method").and_then(Value::as_str) == Some("onchange") {
                return value;
            }
        }
    }
}

async fn testbed() -> (TestBed, Catalog) {
    let catalog = Catalog::open_in_memory().unwrap();
    let mut player = Player::new(Box::new(CatalogMedia::new(catalog.clone())));
    let out = Jitter::Scatter(
        ScatterJitter::new("out", 8, 4096).with_format(SampleFormat::Pcm16LeStereo),
    );
    player.subscribe_output(out.clone());
    let handle = player.handle();
    tokio::spawn(async move {
        let _ = player.run().await;
    });
    // Draine la sortie pour ne jamais bloquer le pipeline.
    tokio::spawn(async move {
        loop {
            match out.peer().await {
                Some(peered) => {
                    let len = peered.len();
                    out.pop(peered, len).await;
                }
                None => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");
    let stop = CancellationToken::new();
    let server = ControlServer::new(&socket, handle, catalog.clone(), Volume::default());
    let server_stop = stop.clone();
    tokio::spawn(async move {
        let _ = server.run(server_stop).await;
    });

    // Attend que le socket existe.
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let client = UnixStream::connect(&socket).await.unwrap();
    (
        TestBed {
            client: BufReader::new(client),
            stop,
            _dir: dir,
        },
        catalog,
    )
}

#[tokio::test]
async fn test_playlist_insert_and_remove_keep_ids() {
    let (mut bed, _catalog) = testbed().await;

    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":1,"method":"append","params":{"url":"file:///a.mp3"}}"#)
        .await;
    assert_eq!(reply["result"]["count"], 1);

    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":2,"method":"list","params":{"first":0,"maxitems":10}}"#)
        .await;
    assert_eq!(reply["result"]["count"], 1);

    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":3,"method":"append","params":{"url":"file:///b.mp3"}}"#)
        .await;
    assert_eq!(reply["result"]["status"], "ok");

    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":4,"method":"list","params":{"first":0,"maxitems":10}}"#)
        .await;
    assert_eq!(reply["result"]["count"], 2);

    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":5,"method":"remove","params":{"id":1}}"#)
        .await;
    assert_eq!(reply["result"]["status"], "ok");

    // L'entrée restante garde son id d'origine.
    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":6,"method":"list","params":{"first":0,"maxitems":10}}"#)
        .await;
    let playlist = reply["result"]["playlist"].as_array().unwrap();
    assert_eq!(playlist.len(), 1);
    assert_eq!(playlist[0]["id"], 2);
    assert_eq!(playlist[0]["url"], "file:///b.mp3");

    bed.stop.cancel();
}

#[tokio::test]
async fn test_status_snapshot_shape() {
    let (mut bed, _catalog) = testbed().await;
    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":1,"method":"status","params":{}}"#)
        .await;
    let result = &reply["result"];
    assert_eq!(result["state"], "stop");
    assert_eq!(result["count"], 0);
    assert!(result["volume"].is_number());
    assert!(result.get("options").is_some());
    bed.stop.cancel();
}

#[tokio::test]
async fn test_unknown_method_yields_method_not_found() {
    let (mut bed, _catalog) = testbed().await;
    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":9,"method":"teleport","params":{}}"#)
        .await;
    assert_eq!(reply["error"]["code"], -32601);
    bed.stop.cancel();
}

#[tokio::test]
async fn test_volume_level_and_step() {
    let (mut bed, _catalog) = testbed().await;
    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":1,"method":"volume","params":{"level":40}}"#)
        .await;
    assert_eq!(reply["result"]["level"], 40);
    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":2,"method":"volume","params":{"step":-15}}"#)
        .await;
    assert_eq!(reply["result"]["level"], 25);
    bed.stop.cancel();
}

#[tokio::test]
async fn test_pause_without_playback_is_refused() {
    let (mut bed, _catalog) = testbed().await;
    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":1,"method":"pause","params":{}}"#)
        .await;
    assert_eq!(reply["error"]["code"], -12345);
    assert_eq!(reply["error"]["data"]["state"], "stop");
    bed.stop.cancel();
}

#[tokio::test]
async fn test_play_pushes_onchange_notification() {
    let (mut bed, catalog) = testbed().await;
    catalog.insert("file:///missing.mp3", None, None).unwrap();

    let reply = bed
        .request(r#"{"jsonrpc":"2.0","id":1,"method":"play","params":{}}"#)
        .await;
    assert_eq!(reply["result"]["state"], "play");

    // Le player change d'état : chaque client reçoit une notification
    // non sollicitée dont le payload est l'instantané complet.
    let notification = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        bed.next_notification(),
    )
    .await
    .unwrap();
    assert!(notification["params"]["state"].is_string());
    assert!(notification["params"].get("volume").is_some());
    bed.stop.cancel();
}
