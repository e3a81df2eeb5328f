//! Configuration du démon : fichier YAML fusionné avec les valeurs par
//! défaut, chemin surchargé par la variable d'environnement
//! `ONDEPLAY_CONFIG`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_CONFIG: &str = "ONDEPLAY_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fichier SQLite du catalogue.
    pub catalog: PathBuf,
    /// URL du sink de sortie.
    pub sink: String,
    /// MIME produit par l'encodeur.
    pub encoder: String,
    /// Socket Unix du plan de contrôle.
    pub control_socket: PathBuf,
    /// Latence cible des trames PCM (millisecondes).
    pub latency_ms: u32,
    /// Volume initial (0..100).
    pub volume: u8,
    /// Statistiques de flux sur chaque piste.
    pub stats: bool,
    #[serde(rename = "loop")]
    pub loop_enabled: bool,
    pub random: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("ondeplay");
        Self {
            catalog: data_dir.join("catalog.db"),
            sink: "alsa://default".to_string(),
            encoder: ondeutils::mime::AUDIO_PCM.to_string(),
            control_socket: PathBuf::from("/tmp/ondeplay.sock"),
            latency_ms: ondecodec::DEFAULT_LATENCY_MS,
            volume: 80,
            stats: false,
            loop_enabled: false,
            random: false,
        }
    }
}

impl Config {
    /// Charge la configuration : chemin explicite, sinon `ONDEPLAY_CONFIG`,
    /// sinon `<config>/ondeplay.yaml` ; un fichier absent donne les
    /// valeurs par défaut.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(ENV_CONFIG).ok().map(PathBuf::from))
            .or_else(|| dirs::config_dir().map(|dir| dir.join("ondeplay.yaml")));
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::info!("config {} absent, defaults in use", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.sink, "alsa://default");
        assert!(config.volume <= 100);
        assert!(!config.loop_enabled);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sink: \"udp://239.0.0.1:5004\"\nvolume: 55").unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.sink, "udp://239.0.0.1:5004");
        assert_eq!(config.volume, 55);
        // Champ non mentionné : valeur par défaut.
        assert_eq!(config.latency_ms, ondecodec::DEFAULT_LATENCY_MS);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/does/not/exist.yaml"))).unwrap();
        assert_eq!(config.encoder, ondeutils::mime::AUDIO_PCM);
    }
}
