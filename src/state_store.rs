use super::*;
use crate::helpers::atomic_write;

#[async_trait]
pub(super) trait StateStore: Send + Sync {
    async fn get(&self, chat_id: i64) -> Result<Option<ChatConfig>>;
    async fn put(&self, chat_id: i64, record: &ChatConfig) -> Result<()>;
    async fn list(&self) -> Result<Vec<(i64, ChatConfig)>>;
}

pub(super) async fn load_or_default(store: &dyn StateStore, chat_id: i64) -> Result<ChatConfig> {
    Ok(store.get(chat_id).await?.unwrap_or_default())
}

pub(super) struct JsonStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStateStore {
    pub(super) fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).with_context(|| format!("create state dir {}", dir.display()))?;
        Ok(JsonStateStore {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, chat_id: i64) -> PathBuf {
        self.dir.join(format!("{}.json", chat_id))
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn get(&self, chat_id: i64) -> Result<Option<ChatConfig>> {
        let path = self.record_path(chat_id);
        if !path.exists() {
            return Ok(None);
        }
        let data =
            fs::read_to_string(&path).with_context(|| format!("read chat state {}", path.display()))?;
        let record = serde_json::from_str(&data)
            .with_context(|| format!("parse chat state {}", path.display()))?;
        Ok(Some(record))
    }

    async fn put(&self, chat_id: i64, record: &ChatConfig) -> Result<()> {
        let data = serde_json::to_vec_pretty(record).context("serialize chat state")?;
        let _guard = self.write_lock.lock().await;
        atomic_write(&self.record_path(chat_id), &data)
    }

    async fn list(&self) -> Result<Vec<(i64, ChatConfig)>> {
        let mut records = Vec::new();
        let entries =
            fs::read_dir(&self.dir).with_context(|| format!("read dir {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read dir entry {}", self.dir.display()))?;
            let path = entry.path();
            let chat_id = match path
                .extension()
                .and_then(|ext| ext.to_str())
                .filter(|ext| *ext == "json")
                .and_then(|_| path.file_stem())
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<i64>().ok())
            {
                Some(id) => id,
                None => continue,
            };
            match self.get(chat_id).await {
                Ok(Some(record)) => records.push((chat_id, record)),
                Ok(None) => {}
                Err(err) => warn!("skipping unreadable chat state {}: {:#}", path.display(), err),
            }
        }
        records.sort_by_key(|(id, _)| *id);
        Ok(records)
    }
}
