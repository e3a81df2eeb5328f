//! Modèle de média : entrées, sac de propriétés, curseur de lecture.

use serde::{Deserialize, Serialize};

/// Sac de propriétés libre d'une entrée (titre, artiste, album, genre,
/// pochette, replay-gain, durée). Le JSON est la représentation
/// canonique, persistée telle quelle par le catalogue ; les accesseurs
/// typés constituent l'unique frontière d'interprétation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo(pub serde_json::Value);

impl MediaInfo {
    pub fn from_value(value: serde_json::Value) -> Self {
        Self(value)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.as_str())
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    pub fn artist(&self) -> Option<&str> {
        self.str_field("artist")
    }

    pub fn album(&self) -> Option<&str> {
        self.str_field("album")
    }

    pub fn genre(&self) -> Option<&str> {
        self.str_field("genre")
    }

    pub fn cover(&self) -> Option<&str> {
        self.str_field("cover")
    }

    /// Gain de piste en dB.
    pub fn replaygain(&self) -> Option<f32> {
        self.0
            .get("replaygain")
            .and_then(|value| value.as_f64())
            .map(|db| db as f32)
    }

    /// Durée en secondes.
    pub fn duration(&self) -> Option<f64> {
        self.0.get("duration").and_then(|value| value.as_f64())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null() || self.0.as_object().map(|o| o.is_empty()).unwrap_or(false)
    }
}

/// Une entrée de média : immuable une fois insérée, `id` sert de
/// poignée externe dense.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaEntry {
    pub id: i64,
    pub url: String,
    pub mime: Option<String>,
    pub info: MediaInfo,
}

/// Options du curseur de lecture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaOptions {
    #[serde(rename = "loop")]
    pub loop_enabled: bool,
    pub random: bool,
}

/// Le curseur de lecture vu par le player : une liste d'entrées et une
/// position courante, mutés par `next`/`end`/`set_next`.
pub trait Media: Send {
    fn count(&self) -> usize;

    /// Avance le curseur et retourne la nouvelle entrée courante ;
    /// `None` quand la liste est épuisée (et que loop est inactif).
    fn next(&mut self) -> Option<MediaEntry>;

    /// L'entrée courante sans déplacer le curseur.
    fn current(&self) -> Option<MediaEntry>;

    /// Remet le curseur avant la première entrée.
    fn end(&mut self);

    fn find(&self, id: i64) -> Option<MediaEntry>;

    /// Force la prochaine entrée servie par `next`.
    fn set_next(&mut self, id: i64) -> bool;

    fn options(&self) -> MediaOptions;

    fn set_options(&mut self, options: MediaOptions);
}

/// Média mono-entrée : une URL jouée directement (commande `change`
/// avec une URL plutôt qu'un catalogue).
pub struct SingleMedia {
    entry: MediaEntry,
    options: MediaOptions,
    played: bool,
}

impl SingleMedia {
    pub fn new(url: &str, mime: Option<&str>, info: MediaInfo) -> Self {
        Self {
            entry: MediaEntry {
                id: 0,
                url: url.to_string(),
                mime: mime.map(str::to_string),
                info,
            },
            options: MediaOptions::default(),
            played: false,
        }
    }
}

impl Media for SingleMedia {
    fn count(&self) -> usize {
        1
    }

    fn next(&mut self) -> Option<MediaEntry> {
        if self.played && !self.options.loop_enabled {
            return None;
        }
        self.played = true;
        Some(self.entry.clone())
    }

    fn current(&self) -> Option<MediaEntry> {
        self.played.then(|| self.entry.clone())
    }

    fn end(&mut self) {
        self.played = false;
    }

    fn find(&self, id: i64) -> Option<MediaEntry> {
        (id == self.entry.id).then(|| self.entry.clone())
    }

    fn set_next(&mut self, id: i64) -> bool {
        id == self.entry.id
    }

    fn options(&self) -> MediaOptions {
        self.options
    }

    fn set_options(&mut self, options: MediaOptions) {
        self.options = options;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_info_accessors() {
        let info = MediaInfo::from_value(json!({
            "title": "Gymnopédie No.1",
            "artist": "Erik Satie",
            "replaygain": -6.5,
            "duration": 210.0,
        }));
        assert_eq!(info.title(), Some("Gymnopédie No.1"));
        assert_eq!(info.artist(), Some("Erik Satie"));
        assert_eq!(info.replaygain(), Some(-6.5));
        assert_eq!(info.duration(), Some(210.0));
        assert_eq!(info.album(), None);
    }

    #[test]
    fn test_single_media_plays_once_without_loop() {
        let mut media = SingleMedia::new("file:///a.mp3", None, MediaInfo::default());
        assert!(media.next().is_some());
        assert!(media.next().is_none());
        media.end();
        assert!(media.next().is_some());
    }

    #[test]
    fn test_single_media_loops_forever_with_loop() {
        let mut media = SingleMedia::new("file:///a.mp3", None, MediaInfo::default());
        media.set_options(MediaOptions {
            loop_enabled: true,
            random: false,
        });
        for _ in 0..5 {
            assert!(media.next().is_some());
        }
    }
}
