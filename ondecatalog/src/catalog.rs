//! Catalogue SQLite : médias persistés et liste de lecture.
//!
//! Deux tables : `media(id, url UNIQUE, mime, info)` où `info` est le
//! sac de propriétés JSON, et `playlist(id)` qui référence les entrées
//! en lecture. À l'insertion d'un fichier local, les tags manquants
//! (titre, artiste, album, genre, durée) sont extraits du fichier.

use std::path::Path;
use std::sync::{Arc, Mutex};

use lofty::{config::ParseOptions, prelude::*, probe::Probe};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use ondeplayer::{MediaEntry, MediaInfo};
use ondeutils::media_url::{MediaUrl, Scheme};
use ondeutils::mime;

use crate::error::{CatalogError, Result};

/// Critères de la commande `filter` : la liste de lecture est refaite
/// avec les médias correspondants.
#[derive(Debug, Clone, Default)]
pub struct FilterQuery {
    pub keyword: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
}

/// Poignée clonable sur le catalogue.
#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Catalogue en mémoire, pour les tests et le mode éphémère.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS media (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 url TEXT UNIQUE NOT NULL,
                 mime TEXT,
                 info BLOB
             );
             CREATE TABLE IF NOT EXISTS playlist (
                 id INTEGER REFERENCES media(id)
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CatalogError::Poisoned)
    }

    /// Insère un média (et l'ajoute à la liste de lecture). Une URL déjà
    /// connue retourne l'id existant sans réinsertion.
    pub fn insert(
        &self,
        url: &str,
        info: Option<MediaInfo>,
        mime_hint: Option<&str>,
    ) -> Result<i64> {
        if let Some(id) = self.find_by_url(url)? {
            return Ok(id);
        }
        let mime_value = mime_hint
            .map(str::to_string)
            .or_else(|| mime::from_path(url).map(str::to_string));
        let info = enrich_info(url, info);
        let info_json = serde_json::to_string(&info.0).unwrap_or_else(|_| "null".into());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO media (url, mime, info) VALUES (?1, ?2, ?3)",
            params![url, mime_value, info_json],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute("INSERT INTO playlist (id) VALUES (?1)", params![id])?;
        tracing::debug!("catalog: new media {} {}", id, url);
        Ok(id)
    }

    pub fn remove_id(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM playlist WHERE id = ?1", params![id])?;
        let removed = conn.execute("DELETE FROM media WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn remove_url(&self, url: &str) -> Result<bool> {
        match self.find_by_url(url)? {
            Some(id) => self.remove_id(id),
            None => Ok(false),
        }
    }

    pub fn find_by_url(&self, url: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT id FROM media WHERE url = ?1",
                params![url],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn find(&self, id: i64) -> Result<Option<MediaEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                "SELECT id, url, mime, info FROM media WHERE id = ?1",
                params![id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Tranche de la liste de lecture, dans l'ordre d'insertion.
    pub fn list(&self, first: usize, maxitems: usize) -> Result<Vec<MediaEntry>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT m.id, m.url, m.mime, m.info FROM playlist p
             JOIN media m ON m.id = p.id
             ORDER BY p.rowid LIMIT ?1 OFFSET ?2",
        )?;
        let rows = statement.query_map(params![maxitems as i64, first as i64], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Nombre d'entrées dans la liste de lecture.
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM playlist", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Ids de la liste de lecture, dans l'ordre.
    pub fn playlist_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        let mut statement =
            conn.prepare("SELECT id FROM playlist ORDER BY rowid")?;
        let rows = statement.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Refait la liste de lecture avec les médias correspondant aux
    /// critères ; retourne le nombre retenu.
    pub fn filter(&self, query: &FilterQuery) -> Result<usize> {
        let conn = self.lock()?;
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(keyword) = &query.keyword {
            clauses.push(
                "(url LIKE ?1 OR CAST(info AS TEXT) LIKE ?1)".to_string(),
            );
            values.push(format!("%{}%", keyword));
        }
        for (field, value) in [
            ("title", &query.title),
            ("artist", &query.artist),
            ("album", &query.album),
            ("genre", &query.genre),
        ] {
            if let Some(value) = value {
                clauses.push(format!(
                    "json_extract(info, '$.{}') LIKE ?{}",
                    field,
                    values.len() + 1
                ));
                values.push(format!("%{}%", value));
            }
        }
        let where_clause = if clauses.is_empty() {
            "1".to_string()
        } else {
            clauses.join(" AND ")
        };
        conn.execute("DELETE FROM playlist", [])?;
        let sql = format!(
            "INSERT INTO playlist (id) SELECT id FROM media WHERE {} ORDER BY id",
            where_clause
        );
        let count = conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(count)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaEntry> {
    let info_raw: Option<String> = row.get(3)?;
    let info = info_raw
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .map(MediaInfo::from_value)
        .unwrap_or_default();
    Ok(MediaEntry {
        id: row.get(0)?,
        url: row.get(1)?,
        mime: row.get(2)?,
        info,
    })
}

/// Complète le sac de propriétés avec les tags du fichier local quand
/// l'URL s'y prête.
fn enrich_info(url: &str, info: Option<MediaInfo>) -> MediaInfo {
    let mut base = info.unwrap_or_default();
    let Ok(parsed) = MediaUrl::parse(url) else {
        return base;
    };
    if parsed.scheme() != Scheme::File {
        return base;
    }
    let path = parsed.file_path();
    let tagged = match Probe::open(&path).and_then(|probe| {
        probe.options(ParseOptions::new()).read()
    }) {
        Ok(tagged) => tagged,
        Err(err) => {
            tracing::debug!("catalog: no tags for {}: {}", path.display(), err);
            return base;
        }
    };
    let mut map = base
        .0
        .as_object()
        .cloned()
        .unwrap_or_default();
    let properties = tagged.properties();
    map.entry("duration".to_string())
        .or_insert_with(|| json!(properties.duration().as_secs_f64()));
    if let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) {
        if let Some(title) = tag.title() {
            map.entry("title".to_string())
                .or_insert_with(|| json!(title.to_string()));
        }
        if let Some(artist) = tag.artist() {
            map.entry("artist".to_string())
                .or_insert_with(|| json!(artist.to_string()));
        }
        if let Some(album) = tag.album() {
            map.entry("album".to_string())
                .or_insert_with(|| json!(album.to_string()));
        }
        if let Some(genre) = tag.genre() {
            map.entry("genre".to_string())
                .or_insert_with(|| json!(genre.to_string()));
        }
    }
    base = MediaInfo::from_value(serde_json::Value::Object(map));
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::open_in_memory().unwrap()
    }

    #[test]
    fn test_insert_then_count_then_remove() {
        let cat = catalog();
        let a = cat.insert("file:///a.mp3", None, None).unwrap();
        assert_eq!(cat.count().unwrap(), 1);
        let b = cat.insert("file:///b.mp3", None, None).unwrap();
        assert_eq!(cat.count().unwrap(), 2);
        assert_ne!(a, b);

        assert!(cat.remove_id(a).unwrap());
        let remaining = cat.list(0, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        // L'entrée restante conserve son id d'origine.
        assert_eq!(remaining[0].id, b);
    }

    #[test]
    fn test_insert_is_idempotent_per_url() {
        let cat = catalog();
        let a = cat.insert("file:///a.mp3", None, None).unwrap();
        let again = cat.insert("file:///a.mp3", None, None).unwrap();
        assert_eq!(a, again);
        assert_eq!(cat.count().unwrap(), 1);
    }

    #[test]
    fn test_mime_guessed_from_extension() {
        let cat = catalog();
        let id = cat.insert("file:///music/x.flac", None, None).unwrap();
        let entry = cat.find(id).unwrap().unwrap();
        assert_eq!(entry.mime.as_deref(), Some(mime::AUDIO_FLAC));
    }

    #[test]
    fn test_filter_by_keyword_and_field() {
        let cat = catalog();
        let info = MediaInfo::from_value(json!({
            "title": "Blue in Green",
            "artist": "Miles Davis",
        }));
        cat.insert("file:///kind_of_blue/3.flac", Some(info), None)
            .unwrap();
        let info = MediaInfo::from_value(json!({
            "title": "So What",
            "artist": "Miles Davis",
        }));
        cat.insert("file:///kind_of_blue/1.flac", Some(info), None)
            .unwrap();
        cat.insert("file:///other/track.mp3", None, None).unwrap();

        let query = FilterQuery {
            artist: Some("Miles".into()),
            ..FilterQuery::default()
        };
        assert_eq!(cat.filter(&query).unwrap(), 2);
        assert_eq!(cat.count().unwrap(), 2);

        let query = FilterQuery {
            keyword: Some("Green".into()),
            ..FilterQuery::default()
        };
        assert_eq!(cat.filter(&query).unwrap(), 1);

        // Sans critère, tout revient en liste.
        assert_eq!(cat.filter(&FilterQuery::default()).unwrap(), 3);
    }
}
