//! Types MIME audio compris par le lecteur.

pub const AUDIO_MP3: &str = "audio/mp3";
pub const AUDIO_MPEG: &str = "audio/mpeg";
pub const AUDIO_FLAC: &str = "audio/flac";
pub const AUDIO_AAC: &str = "audio/aac";
pub const AUDIO_OPUS: &str = "audio/opus";
pub const AUDIO_PCM: &str = "audio/pcm";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Sonde rapide par extension, utilisée à l'insertion au catalogue et
/// pour les URLs sans indication de type.
pub fn from_path(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp3" => Some(AUDIO_MP3),
        "flac" => Some(AUDIO_FLAC),
        "aac" | "adts" => Some(AUDIO_AAC),
        "opus" => Some(AUDIO_OPUS),
        "pcm" | "raw" => Some(AUDIO_PCM),
        _ => None,
    }
}

/// Ramène les alias connus sur la forme canonique.
pub fn canonical(mime: &str) -> &str {
    match mime {
        AUDIO_MPEG | "audio/mp3" => AUDIO_MP3,
        "audio/x-flac" => AUDIO_FLAC,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path() {
        assert_eq!(from_path("/music/a.MP3"), Some(AUDIO_MP3));
        assert_eq!(from_path("b.flac"), Some(AUDIO_FLAC));
        assert_eq!(from_path("noextension"), None);
    }

    #[test]
    fn test_canonical_aliases() {
        assert_eq!(canonical(AUDIO_MPEG), AUDIO_MP3);
        assert_eq!(canonical("audio/x-flac"), AUDIO_FLAC);
        assert_eq!(canonical("audio/opus"), AUDIO_OPUS);
    }
}
