use super::*;
use crate::helpers::parse_time_of_day;
use crate::server::Job;
use crate::state_store::StateStore;
use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::task::JoinHandle;

struct Trigger {
    time: String,
    handle: JoinHandle<()>,
}

/// Daily autopost triggers, indexed by chat id. A firing trigger does not
/// publish itself; it enqueues `Job::Trigger` so the run is serialized with
/// that chat's other updates.
pub(super) struct Scheduler {
    timezone: Tz,
    queue: mpsc::Sender<Job>,
    triggers: Mutex<HashMap<i64, Vec<Trigger>>>,
}

/// First occurrence of `at` in `now`'s zone strictly after `now`. Local times
/// skipped by a DST jump move to the next day.
pub(super) fn next_fire_after(now: DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let zone = now.timezone();
    let today = now.date_naive();
    for offset in 0..=2u64 {
        let Some(day) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        if let Some(candidate) = zone.from_local_datetime(&day.and_time(at)).earliest() {
            if candidate > now {
                return candidate;
            }
        }
    }
    now + chrono::Duration::days(1)
}

impl Scheduler {
    pub(super) fn new(timezone: Tz, queue: mpsc::Sender<Job>) -> Self {
        Scheduler {
            timezone,
            queue,
            triggers: Mutex::new(HashMap::new()),
        }
    }

    pub(super) async fn schedule(&self, chat_id: i64, times: &[String]) -> usize {
        let mut triggers = self.triggers.lock().await;
        if let Some(old) = triggers.remove(&chat_id) {
            for trigger in old {
                trigger.handle.abort();
            }
        }

        let mut registered = Vec::new();
        for time in times {
            let at = match parse_time_of_day(time) {
                Some(at) => at,
                None => {
                    warn!("chat {}: skipping unparseable autopost time {:?}", chat_id, time);
                    continue;
                }
            };
            let handle = tokio::spawn(run_trigger(chat_id, at, self.timezone, self.queue.clone()));
            registered.push(Trigger {
                time: time.clone(),
                handle,
            });
        }

        let count = registered.len();
        if count > 0 {
            triggers.insert(chat_id, registered);
        }
        info!("chat {}: registered {} autopost triggers", chat_id, count);
        count
    }

    pub(super) async fn cancel(&self, chat_id: i64) -> usize {
        let removed = self.triggers.lock().await.remove(&chat_id).unwrap_or_default();
        for trigger in &removed {
            trigger.handle.abort();
        }
        if !removed.is_empty() {
            info!("chat {}: cancelled {} autopost triggers", chat_id, removed.len());
        }
        removed.len()
    }

    pub(super) async fn registered_times(&self, chat_id: i64) -> Vec<String> {
        self.triggers
            .lock()
            .await
            .get(&chat_id)
            .map(|list| list.iter().map(|t| t.time.clone()).collect())
            .unwrap_or_default()
    }

    pub(super) async fn restore(&self, store: &dyn StateStore) -> Result<usize> {
        let mut total = 0;
        for (chat_id, config) in store.list().await? {
            if config.autopost_enabled && !config.autopost_times.is_empty() {
                total += self.schedule(chat_id, &config.autopost_times).await;
            }
        }
        Ok(total)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for trigger in self.triggers.get_mut().values().flatten() {
            trigger.handle.abort();
        }
    }
}

async fn run_trigger(chat_id: i64, at: NaiveTime, timezone: Tz, queue: mpsc::Sender<Job>) {
    let mut after = Utc::now().with_timezone(&timezone);
    loop {
        let fire_at = next_fire_after(after, at);
        let wait = (fire_at.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        debug!("chat {}: autopost trigger {} fired", chat_id, at.format("%H:%M"));
        if queue.send(Job::Trigger { chat_id }).await.is_err() {
            warn!("chat {}: job queue closed, stopping trigger", chat_id);
            return;
        }
        after = fire_at.max(Utc::now().with_timezone(&timezone));
    }
}
