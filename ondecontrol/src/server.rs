//! Serveur de contrôle sur socket Unix.
//!
//! Une tâche par client ; chaque ligne reçue est une requête JSON-RPC,
//! chaque changement d'état ou de piste du player part vers tous les
//! clients connectés en notification `onchange` non sollicitée.

use std::path::PathBuf;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use ondecatalog::{Catalog, CatalogMedia};
use ondeplayer::{Media, MediaInfo, MediaOptions, PlayerHandle, SingleMedia, State};
use ondestream::Volume;

use crate::error::{ControlError, Result};
use crate::proto::{
    self, error_response, notification, parse_line, AppendItem, RemoveTarget, Request, RpcError,
};

/// Le serveur de contrôle : poignées sur le player, le catalogue et le
/// volume.
#[derive(Clone)]
pub struct ControlServer {
    path: PathBuf,
    player: PlayerHandle,
    catalog: Catalog,
    volume: Volume,
}

impl ControlServer {
    pub fn new(
        path: impl Into<PathBuf>,
        player: PlayerHandle,
        catalog: Catalog,
        volume: Volume,
    ) -> Self {
        Self {
            path: path.into(),
            player,
            catalog,
            volume,
        }
    }

    /// Boucle d'acceptation ; une tâche par client.
    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path).map_err(|err| ControlError::Bind {
            path: self.path.display().to_string(),
            details: err.to_string(),
        })?;
        tracing::info!("control: listening on {}", self.path.display());
        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    let server = self.clone();
                    let client_stop = stop.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.serve_client(stream, client_stop).await {
                            tracing::debug!("control: client ended: {}", err);
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!("control: accept failed: {}", err);
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }

    async fn serve_client(&self, stream: UnixStream, stop: CancellationToken) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut changes = self.player.onchange();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let payload = self.status_snapshot().await;
                    let text = serde_json::to_string(&notification("onchange", payload))
                        .unwrap_or_default();
                    writer.write_all(text.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = match parse_line(&line) {
                        Ok(call) => match self.dispatch(call.request).await {
                            Ok(result) => proto::response(&call.id, result),
                            Err(err) => error_response(&call.id, &err),
                        },
                        Err((id, err)) => error_response(&id, &err),
                    };
                    let text = serde_json::to_string(&reply).unwrap_or_default();
                    writer.write_all(text.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> std::result::Result<Value, RpcError> {
        match request {
            Request::Play => self.transport(State::Play),
            Request::Pause => self.transport(State::Pause),
            Request::Stop => self.transport(State::Stop),
            Request::Next => {
                let state = self.player.next();
                Ok(json!({ "state": public_state(state) }))
            }
            Request::SetNext { id } => {
                let accepted = self
                    .with_media(|media| media.set_next(id))
                    .unwrap_or(false);
                if accepted {
                    Ok(json!({ "next": id }))
                } else {
                    Err(RpcError::domain("unknown media", json!({ "id": id })))
                }
            }
            Request::List { first, maxitems } => {
                let count = self.catalog.count().unwrap_or(0);
                let entries = self
                    .catalog
                    .list(first, maxitems)
                    .map_err(internal_error)?;
                let playlist: Vec<Value> = entries.iter().map(entry_value).collect();
                Ok(json!({
                    "count": count,
                    "nbitems": playlist.len(),
                    "playlist": playlist,
                }))
            }
            Request::Info { id } => match self.catalog.find(id).map_err(internal_error)? {
                Some(entry) => Ok(entry_value(&entry)),
                None => Err(RpcError::domain("unknown media", json!({ "id": id }))),
            },
            Request::Filter(query) => {
                let count = self.catalog.filter(&query).map_err(internal_error)?;
                Ok(json!({ "count": count }))
            }
            Request::Append(items) => self.append(items),
            Request::Remove(targets) => self.remove(targets),
            Request::Change {
                media,
                id,
                next,
                options,
            } => self.change(media, id, next, &options),
            Request::Status | Request::OnChange => Ok(self.status_snapshot().await),
            Request::Options {
                loop_enabled,
                random,
            } => {
                let options = self
                    .with_media(|media| {
                        let mut options = media.options();
                        if let Some(value) = loop_enabled {
                            options.loop_enabled = value;
                        }
                        if let Some(value) = random {
                            options.random = value;
                        }
                        media.set_options(options);
                        options
                    })
                    .unwrap_or_default();
                Ok(json!({
                    "loop": options.loop_enabled,
                    "random": options.random,
                }))
            }
            Request::Volume { level, step } => {
                let level = match (level, step) {
                    (Some(level), _) => self.volume.set(level),
                    (None, Some(step)) => self.volume.step(step),
                    (None, None) => self.volume.level(),
                };
                Ok(json!({ "level": level }))
            }
            Request::GetPosition => {
                let (position, duration) = self.player.position().await;
                Ok(json!({
                    "position": position,
                    "duration": duration,
                }))
            }
            Request::Capabilities => Ok(capabilities()),
        }
    }

    fn transport(&self, want: State) -> std::result::Result<Value, RpcError> {
        match self.player.request(want) {
            Ok(state) => Ok(json!({ "state": public_state(state) })),
            Err(current) => Err(RpcError::domain(
                "transition refused",
                json!({ "state": public_state(current) }),
            )),
        }
    }

    fn append(&self, items: Vec<AppendItem>) -> std::result::Result<Value, RpcError> {
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let info = item.info.map(MediaInfo::from_value);
            let id = self
                .catalog
                .insert(&item.url, info, item.mime.as_deref())
                .map_err(internal_error)?;
            ids.push(id);
        }
        let first = ids.first().copied();
        Ok(json!({
            "status": "ok",
            "id": first,
            "count": ids.len(),
        }))
    }

    fn remove(&self, targets: Vec<RemoveTarget>) -> std::result::Result<Value, RpcError> {
        let mut removed = 0usize;
        for target in targets {
            let done = match target {
                RemoveTarget::Id(id) => self.catalog.remove_id(id).map_err(internal_error)?,
                RemoveTarget::Url(url) => {
                    self.catalog.remove_url(&url).map_err(internal_error)?
                }
            };
            if done {
                removed += 1;
            }
        }
        if removed == 0 {
            return Err(RpcError::domain("nothing removed", json!({})));
        }
        Ok(json!({ "status": "ok" }))
    }

    fn change(
        &self,
        media: Option<String>,
        id: Option<i64>,
        next: bool,
        options: &[String],
    ) -> std::result::Result<Value, RpcError> {
        let media_options = MediaOptions {
            loop_enabled: options.iter().any(|option| option == "loop"),
            random: options.iter().any(|option| option == "random"),
        };
        match (media, id) {
            (Some(url), _) => {
                // Une URL de catalogue recharge le curseur ; toute autre
                // URL devient un média mono-entrée.
                let boxed: Box<dyn ondeplayer::Media> = if url.starts_with("db://") {
                    let mut cursor = CatalogMedia::new(self.catalog.clone());
                    cursor.set_options(media_options);
                    Box::new(cursor)
                } else {
                    let mut single = SingleMedia::new(&url, None, MediaInfo::default());
                    single.set_options(media_options);
                    Box::new(single)
                };
                self.player.set_media(boxed);
            }
            (None, Some(id)) => {
                let accepted = self
                    .with_media(|media| media.set_next(id))
                    .unwrap_or(false);
                if !accepted {
                    return Err(RpcError::domain("unknown media", json!({ "id": id })));
                }
            }
            (None, None) => {
                return Err(RpcError::new(
                    proto::INVALID_PARAMS,
                    "change needs media or id",
                ))
            }
        }
        let state = if next {
            // La nouvelle liste prendra effet à la prochaine transition.
            self.player.state()
        } else {
            match self.player.state() {
                State::Play | State::Pause => self.player.next(),
                _ => self.player.request(State::Play).unwrap_or(State::Stop),
            }
        };
        Ok(json!({
            "media": "changed",
            "state": public_state(state),
        }))
    }

    fn with_media<R>(
        &self,
        apply: impl FnOnce(&mut Box<dyn ondeplayer::Media>) -> R,
    ) -> Option<R> {
        let media = self.player.media();
        let mut guard = media.lock().ok()?;
        Some(apply(&mut guard))
    }

    /// L'instantané complet renvoyé par `status` et poussé en
    /// notification `onchange`.
    async fn status_snapshot(&self) -> Value {
        let state = self.player.state();
        let id = self.player.current_id();
        let entry = id.and_then(|id| self.catalog.find(id).ok().flatten());
        let options = self
            .with_media(|media| media.options())
            .unwrap_or_default();
        let next = id.and_then(|id| self.next_in_playlist(id, options.loop_enabled));
        let (info, media_url) = match &entry {
            Some(entry) => (entry.info.0.clone(), Value::from(entry.url.clone())),
            None => (Value::Null, Value::Null),
        };
        json!({
            "state": public_state(state),
            "id": id,
            "info": info,
            "next": next,
            "count": self.catalog.count().unwrap_or(0),
            "media": media_url,
            "options": {
                "loop": options.loop_enabled,
                "random": options.random,
            },
            "volume": self.volume.level(),
        })
    }

    fn next_in_playlist(&self, id: i64, loop_enabled: bool) -> Option<i64> {
        let ids = self.catalog.playlist_ids().ok()?;
        let index = ids.iter().position(|&entry| entry == id)?;
        match ids.get(index + 1) {
            Some(&next) => Some(next),
            None if loop_enabled => ids.first().copied(),
            None => None,
        }
    }
}

/// L'état `change` est transitoire : vu du protocole, c'est déjà de la
/// lecture.
fn public_state(state: State) -> &'static str {
    match state {
        State::Change => "play",
        other => other.as_str(),
    }
}

fn entry_value(entry: &ondeplayer::MediaEntry) -> Value {
    json!({
        "id": entry.id,
        "url": entry.url,
        "mime": entry.mime,
        "info": entry.info.0,
    })
}

fn internal_error(err: impl std::fmt::Display) -> RpcError {
    RpcError::new(proto::DOMAIN_ERROR, err.to_string())
}

fn capabilities() -> Value {
    json!({
        "events": ["onchange"],
        "actions": [
            "play", "pause", "stop", "next", "setnext", "list", "info",
            "filter", "append", "remove", "change", "status", "onchange",
            "options", "volume", "getposition", "capabilities",
        ],
        "decoders": [
            ondeutils::mime::AUDIO_MP3,
            ondeutils::mime::AUDIO_FLAC,
            ondeutils::mime::AUDIO_AAC,
            ondeutils::mime::AUDIO_OPUS,
            ondeutils::mime::AUDIO_PCM,
        ],
        "encoders": [
            ondeutils::mime::AUDIO_MP3,
            ondeutils::mime::AUDIO_FLAC,
            ondeutils::mime::AUDIO_OPUS,
            ondeutils::mime::AUDIO_PCM,
        ],
        "protocols": ["file", "http", "https", "udp", "rtp", "unix", "db", "alsa"],
    })
}
