use super::Database;
use crate::history::types::{MostVisitedUrl, TopSitesDelta};
use anyhow::{Context, Result};
use rusqlite::params;

impl Database {
    /// The last persisted top sites list in rank order.
    pub fn get_top_sites(&self) -> Result<Vec<MostVisitedUrl>> {
        let mut statement = self
            .conn
            .prepare("SELECT url, title, score FROM top_sites ORDER BY url_rank ASC")?;

        let sites = statement
            .query_map([], |row| {
                Ok(MostVisitedUrl {
                    url: row.get(0)?,
                    title: row.get(1)?,
                    score: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query top sites")?;

        Ok(sites)
    }

    pub fn apply_top_sites_delta(&mut self, delta: &TopSitesDelta) -> Result<()> {
        let transaction = self
            .conn
            .transaction()
            .context("Failed to start transaction")?;

        delta.deleted.iter().try_for_each(|entry| {
            transaction
                .execute(
                    "DELETE FROM top_sites WHERE url = ?1",
                    params![entry.url.url],
                )
                .context("Failed to delete top site")
                .map(|_| ())
        })?;

        delta
            .added
            .iter()
            .chain(delta.moved.iter())
            .try_for_each(|entry| {
                transaction
                    .execute(
                        "INSERT INTO top_sites (url, url_rank, title, score) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(url)
                         DO UPDATE SET url_rank = excluded.url_rank, title = excluded.title, score = excluded.score",
                        params![
                            entry.url.url,
                            entry.rank as i64,
                            entry.url.title,
                            entry.url.score
                        ],
                    )
                    .context("Failed to write top site")
                    .map(|_| ())
            })?;

        transaction
            .commit()
            .context("Failed to commit top sites")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::types::MostVisitedUrlWithRank;

    fn ranked(url: &str, rank: usize) -> MostVisitedUrlWithRank {
        MostVisitedUrlWithRank {
            url: MostVisitedUrl::new(url, format!("title {url}"), 1.0),
            rank,
        }
    }

    #[test]
    fn deltas_are_applied_in_rank_order() {
        let mut database = Database::open_in_memory().expect("open database");
        database
            .apply_top_sites_delta(&TopSitesDelta {
                added: vec![ranked("https://a/", 0), ranked("https://b/", 1)],
                ..TopSitesDelta::default()
            })
            .expect("apply");

        database
            .apply_top_sites_delta(&TopSitesDelta {
                added: vec![ranked("https://c/", 1)],
                moved: vec![ranked("https://a/", 0)],
                deleted: vec![ranked("https://b/", 1)],
            })
            .expect("apply");

        let urls: Vec<_> = database
            .get_top_sites()
            .expect("top sites")
            .into_iter()
            .map(|site| site.url)
            .collect();
        assert_eq!(urls, vec!["https://a/", "https://c/"]);
    }
}
