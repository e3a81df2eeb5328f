//! Curseur de lecture sur le catalogue.
//!
//! L'ordre de visite est figé au début de chaque tour : séquentiel, ou
//! mélangé quand l'option random est active (remélangé à chaque tour).
//! L'option loop fait repartir le curseur au terme d'un tour.

use rand::seq::SliceRandom;

use ondeplayer::{Media, MediaEntry, MediaOptions};

use crate::catalog::Catalog;

pub struct CatalogMedia {
    catalog: Catalog,
    order: Vec<i64>,
    position: Option<usize>,
    forced_next: Option<i64>,
    options: MediaOptions,
}

impl CatalogMedia {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            order: Vec::new(),
            position: None,
            forced_next: None,
            options: MediaOptions::default(),
        }
    }

    fn refresh_order(&mut self) {
        self.order = self.catalog.playlist_ids().unwrap_or_default();
        if self.options.random {
            self.order.shuffle(&mut rand::rng());
        }
    }
}

impl Media for CatalogMedia {
    fn count(&self) -> usize {
        self.catalog.count().unwrap_or(0)
    }

    fn next(&mut self) -> Option<MediaEntry> {
        if let Some(id) = self.forced_next.take() {
            if let Ok(Some(entry)) = self.catalog.find(id) {
                // Réaligne le curseur sur l'entrée forcée quand elle
                // figure dans le tour en cours.
                if let Some(index) = self.order.iter().position(|&i| i == id) {
                    self.position = Some(index);
                }
                return Some(entry);
            }
        }
        loop {
            let next_pos = match self.position {
                None => {
                    self.refresh_order();
                    0
                }
                Some(position) => position + 1,
            };
            if next_pos >= self.order.len() {
                if !self.options.loop_enabled {
                    return None;
                }
                self.position = None;
                self.refresh_order();
                if self.order.is_empty() {
                    return None;
                }
                self.position = Some(0);
            } else {
                self.position = Some(next_pos);
            }
            let index = self.position?;
            let id = *self.order.get(index)?;
            match self.catalog.find(id) {
                // Une entrée supprimée entre-temps est simplement sautée.
                Ok(Some(entry)) => return Some(entry),
                _ => continue,
            }
        }
    }

    fn current(&self) -> Option<MediaEntry> {
        let index = self.position?;
        let id = *self.order.get(index)?;
        self.catalog.find(id).ok().flatten()
    }

    fn end(&mut self) {
        self.position = None;
        self.forced_next = None;
    }

    fn find(&self, id: i64) -> Option<MediaEntry> {
        self.catalog.find(id).ok().flatten()
    }

    fn set_next(&mut self, id: i64) -> bool {
        match self.catalog.find(id) {
            Ok(Some(_)) => {
                self.forced_next = Some(id);
                true
            }
            _ => false,
        }
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

    fn seeded() -> CatalogMedia {
        let catalog = Catalog::open_in_memory().unwrap();
        for name in ["a", "b", "c"] {
            catalog
                .insert(&format!("file:///{}.mp3", name), None, None)
                .unwrap();
        }
        CatalogMedia::new(catalog)
    }

    #[test]
    fn test_sequential_visit_then_exhausted() {
        let mut media = seeded();
        let mut urls = Vec::new();
        while let Some(entry) = media.next() {
            urls.push(entry.url);
        }
        assert_eq!(
            urls,
            vec!["file:///a.mp3", "file:///b.mp3", "file:///c.mp3"]
        );
        // Épuisé : reste épuisé tant que le curseur n'est pas remis.
        assert!(media.next().is_none());
        media.end();
        assert!(media.next().is_some());
    }

    #[test]
    fn test_loop_revisits_entries() {
        let mut media = seeded();
        media.set_options(MediaOptions {
            loop_enabled: true,
            random: false,
        });
        let mut seen = 0;
        for _ in 0..7 {
            assert!(media.next().is_some());
            seen += 1;
        }
        assert_eq!(seen, 7);
    }

    #[test]
    fn test_random_visits_every_entry_once_per_lap() {
        let mut media = seeded();
        media.set_options(MediaOptions {
            loop_enabled: false,
            random: true,
        });
        let mut urls = Vec::new();
        while let Some(entry) = media.next() {
            urls.push(entry.url);
        }
        urls.sort();
        assert_eq!(
            urls,
            vec!["file:///a.mp3", "file:///b.mp3", "file:///c.mp3"]
        );
    }

    #[test]
    fn test_set_next_forces_entry() {
        let mut media = seeded();
        let first = media.next().unwrap();
        assert_eq!(first.url, "file:///a.mp3");
        let target = media.find(3).unwrap();
        assert!(media.set_next(target.id));
        let forced = media.next().unwrap();
        assert_eq!(forced.id, target.id);
    }

    #[test]
    fn test_set_next_unknown_id_is_refused() {
        let mut media = seeded();
        assert!(!media.set_next(999));
    }

    #[test]
    fn test_removed_entry_is_skipped() {
        let catalog = Catalog::open_in_memory().unwrap();
        for name in ["a", "b", "c"] {
            catalog
                .insert(&format!("file:///{}.mp3", name), None, None)
                .unwrap();
        }
        let mut media = CatalogMedia::new(catalog.clone());
        let first = media.next().unwrap();
        assert_eq!(first.url, "file:///a.mp3");
        // La deuxième entrée disparaît du catalogue.
        catalog.remove_id(2).unwrap();
        let entry = media.next().unwrap();
        assert_eq!(entry.url, "file:///c.mp3");
    }
}
