//! OndeCatalog - Catalogue de médias persisté et curseur de lecture
//!
//! Le catalogue range les médias dans un fichier SQLite
//! (`media(id, url, mime, info)` + `playlist(id)`) ; le sac de
//! propriétés `info` est stocké en JSON et complété à l'insertion par
//! les tags du fichier quand l'URL est locale. [`CatalogMedia`] en fait
//! un curseur pour le player, avec les options loop et random.

mod catalog;
mod cursor;
mod error;

pub use catalog::{Catalog, FilterQuery};
pub use cursor::CatalogMedia;
pub use error::{CatalogError, Result};
