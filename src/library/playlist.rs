// Playlist ordering: persisted order, drag reorder, sort and shuffle
use rand::seq::SliceRandom;
use rand::Rng;

use crate::library::models::Library;

impl Library {
    /// Reorder songs to follow a persisted list of grouping keys. Listed songs
    /// come first in list order; songs the list doesn't mention keep their
    /// relative order after them. Unknown keys are ignored.
    pub fn apply_order(&mut self, order: &[String]) {
        let rank = |key: &str| order.iter().position(|k| k == key).unwrap_or(usize::MAX);
        // Stable sort keeps scan order among unranked songs
        self.songs.sort_by_key(|song| rank(&song.grouping_key));
    }

    /// Move the song at `from` so it ends up at `to`
    pub fn move_song(&mut self, from: usize, to: usize) -> bool {
        if from >= self.songs.len() || to >= self.songs.len() || from == to {
            return false;
        }
        let song = self.songs.remove(from);
        self.songs.insert(to, song);
        true
    }

    /// Sort by grouping key, case-insensitively
    pub fn sort_by_name(&mut self, ascending: bool) {
        self.songs.sort_by(|a, b| {
            let ordering = a
                .grouping_key
                .to_lowercase()
                .cmp(&b.grouping_key.to_lowercase());
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
    }

    /// Fisher-Yates shuffle of the whole playlist
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.songs.shuffle(rng);
    }
}
