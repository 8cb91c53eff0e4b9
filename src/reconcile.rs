use std::collections::HashMap;

use crate::models::{AttachmentView, MessageView};
use crate::repo::Repo;

/// What a reconnecting client told us, plus what presence already knows.
#[derive(Debug, Default)]
pub struct ReconcileOptions {
    /// Client asked for a history backfill.
    pub history: bool,
    /// Message ids the client already holds locally.
    pub known_ids: Vec<i64>,
    /// The user had another live connection when this one registered.
    pub was_online: bool,
    /// This connection restores a prior one; everything collapses into the
    /// missed bucket.
    pub restored: bool,
}

/// Messages owed to a reconnecting client, grouped per room, ascending by id.
/// Missed and history never share a message.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub missed: HashMap<i64, Vec<MessageView>>,
    pub history: HashMap<i64, Vec<MessageView>>,
}

pub struct ReconciliationEngine {
    repo: Repo,
}

impl ReconciliationEngine {
    pub fn new(repo: Repo) -> Self {
        Self { repo }
    }

    /// Partition everything past the per-room last-read cutoff:
    /// - missed: the whole eligible set, but only if the user had no other
    ///   live connection (otherwise some tab already has them);
    /// - history: on request, eligible minus the client's known ids minus
    ///   whatever missed already took.
    pub async fn reconcile(
        &self,
        user_id: i64,
        opts: &ReconcileOptions,
    ) -> sqlx::Result<ReconcilePlan> {
        let eligible = self.repo.unread_messages(user_id).await?;

        let mut missed: Vec<MessageView> = if opts.was_online {
            Vec::new()
        } else {
            eligible.clone()
        };
        let mut history: Vec<MessageView> = if opts.history {
            eligible
                .iter()
                .filter(|m| !opts.known_ids.contains(&m.id))
                .filter(|m| !missed.iter().any(|o| o.id == m.id))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        if opts.restored {
            missed.append(&mut history);
            missed.sort_by_key(|m| (m.room_id, m.id));
        }

        self.inline_attachments(missed.iter_mut().chain(history.iter_mut()))
            .await?;

        Ok(ReconcilePlan {
            missed: group_by_room(missed),
            history: group_by_room(history),
        })
    }

    async fn inline_attachments(
        &self,
        messages: impl Iterator<Item = &mut MessageView>,
    ) -> sqlx::Result<()> {
        let mut with_media: Vec<&mut MessageView> = messages.filter(|m| m.symbol.is_some()).collect();
        if with_media.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = with_media.iter().map(|m| m.id).collect();
        let rows = self.repo.attachments_for(&ids).await?;
        for message in &mut with_media {
            for (message_id, symbol, img, preview, kind) in &rows {
                if *message_id == message.id {
                    message.files.insert(
                        symbol.clone(),
                        AttachmentView {
                            url: img.clone(),
                            preview: preview.clone(),
                            kind: kind.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

fn group_by_room(messages: Vec<MessageView>) -> HashMap<i64, Vec<MessageView>> {
    let mut grouped: HashMap<i64, Vec<MessageView>> = HashMap::new();
    for message in messages {
        grouped.entry(message.room_id).or_default().push(message);
    }
    for batch in grouped.values_mut() {
        batch.sort_by_key(|m| m.id);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::testutil::*;

    /// User 1 in room 5, pointer at 100; messages 101 and 102 arrived since.
    async fn engine() -> ReconciliationEngine {
        let pool = pool().await;
        seed_user(&pool, 1, "alice", 2).await;
        seed_user(&pool, 2, "bob", 1).await;
        seed_room(&pool, 5, Some("lobby"), false).await;
        seed_membership(&pool, 5, 1, Some(100)).await;
        seed_message(&pool, 100, 2, 5, "read already", None).await;
        seed_message(&pool, 101, 2, 5, "missed one", None).await;
        seed_message(&pool, 102, 2, 5, "missed two", None).await;
        ReconciliationEngine::new(Repo::new(pool))
    }

    fn ids(plan: &HashMap<i64, Vec<MessageView>>, room: i64) -> Vec<i64> {
        plan.get(&room)
            .map(|batch| batch.iter().map(|m| m.id).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn offline_reconnect_gets_missed_only() {
        let engine = engine().await;
        let plan = engine
            .reconcile(1, &ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(ids(&plan.missed, 5), vec![101, 102]);
        assert!(plan.history.is_empty());
    }

    #[tokio::test]
    async fn online_elsewhere_gets_history_minus_known() {
        let engine = engine().await;
        let plan = engine
            .reconcile(
                1,
                &ReconcileOptions {
                    history: true,
                    known_ids: vec![101],
                    was_online: true,
                    restored: false,
                },
            )
            .await
            .unwrap();
        assert!(plan.missed.is_empty());
        assert_eq!(ids(&plan.history, 5), vec![102]);
    }

    #[tokio::test]
    async fn missed_and_history_never_overlap() {
        let engine = engine().await;
        let plan = engine
            .reconcile(
                1,
                &ReconcileOptions {
                    history: true,
                    known_ids: Vec::new(),
                    was_online: false,
                    restored: false,
                },
            )
            .await
            .unwrap();
        // everything eligible went to missed; history claims none of it
        assert_eq!(ids(&plan.missed, 5), vec![101, 102]);
        assert!(plan.history.is_empty());
    }

    #[tokio::test]
    async fn union_covers_everything_past_the_cutoff() {
        let engine = engine().await;
        let plan = engine
            .reconcile(
                1,
                &ReconcileOptions {
                    history: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut union = ids(&plan.missed, 5);
        union.extend(ids(&plan.history, 5));
        union.sort_unstable();
        assert_eq!(union, vec![101, 102]);
    }

    #[tokio::test]
    async fn restoration_collapses_history_into_missed() {
        let engine = engine().await;
        let plan = engine
            .reconcile(
                1,
                &ReconcileOptions {
                    history: true,
                    known_ids: vec![101],
                    was_online: true,
                    restored: true,
                },
            )
            .await
            .unwrap();
        assert!(plan.history.is_empty());
        assert_eq!(ids(&plan.missed, 5), vec![102]);
    }

    #[tokio::test]
    async fn attachments_are_inlined_under_their_symbol() {
        let pool = pool().await;
        seed_user(&pool, 1, "alice", 2).await;
        seed_room(&pool, 5, Some("lobby"), false).await;
        seed_membership(&pool, 5, 1, None).await;
        seed_message(&pool, 10, 1, 5, "look \u{3bb}", Some("a")).await;
        seed_image(&pool, 10, "a", "cats.png", "i").await;
        let engine = ReconciliationEngine::new(Repo::new(pool));

        let plan = engine
            .reconcile(1, &ReconcileOptions::default())
            .await
            .unwrap();
        let batch = &plan.missed[&5];
        let file = &batch[0].files["a"];
        assert_eq!(file.url.as_deref(), Some("cats.png"));
        assert_eq!(file.kind, "i");
    }

    #[tokio::test]
    async fn rooms_are_grouped_separately() {
        let pool = pool().await;
        seed_user(&pool, 1, "alice", 2).await;
        seed_room(&pool, 5, Some("lobby"), false).await;
        seed_room(&pool, 6, None, false).await;
        seed_membership(&pool, 5, 1, None).await;
        seed_membership(&pool, 6, 1, None).await;
        seed_message(&pool, 10, 1, 5, "in five", None).await;
        seed_message(&pool, 11, 1, 6, "in six", None).await;
        let engine = ReconciliationEngine::new(Repo::new(pool));

        let plan = engine
            .reconcile(1, &ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(ids(&plan.missed, 5), vec![10]);
        assert_eq!(ids(&plan.missed, 6), vec![11]);
    }
}
