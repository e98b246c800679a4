// 实时输出通道
//
// 输出块先写入 task_output 表，订阅者按游标轮询该表，因此执行器与订阅者
// 可以在不同进程中。同进程内另有一组 watch 通道用于即时唤醒订阅者。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::models::settings::StreamSettings;
use crate::models::{TaskFailure, TaskStatus};
use crate::ssh::OutputStream;
use crate::store::{Database, OutputChunk, StoreError};

/// 单次读取的最大输出块数
const FETCH_BATCH: usize = 256;

/// 推送给订阅者的消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk {
        stream: OutputStream,
        data: String,
    },
    Done {
        status: TaskStatus,
        #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none", default)]
        exit_code: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<TaskFailure>,
    },
}

/// 同进程唤醒
#[derive(Default)]
struct Hub {
    channels: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl Hub {
    fn subscribe(&self, task_id: &str) -> watch::Receiver<u64> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    fn notify(&self, task_id: &str) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = channels.get(task_id) {
            tx.send_modify(|v| *v = v.wrapping_add(1));
        }
    }

    fn release(&self, task_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(task_id);
    }

    /// 最后一个订阅者离开时移除通道
    fn unsubscribe(&self, task_id: &str, rx: watch::Receiver<u64>) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        drop(rx);
        if channels
            .get(task_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(task_id);
        }
    }

    fn len(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// 实时输出通道
pub struct LiveOutputChannel {
    db: Arc<Database>,
    hub: Arc<Hub>,
    settings: StreamSettings,
}

impl LiveOutputChannel {
    pub fn new(db: Arc<Database>, settings: StreamSettings) -> Self {
        Self {
            db,
            hub: Arc::new(Hub::default()),
            settings,
        }
    }

    /// 持久化一个输出块并唤醒订阅者，返回其序号
    pub fn publish(
        &self,
        task_id: &str,
        stream: OutputStream,
        data: &[u8],
    ) -> Result<i64, StoreError> {
        let seq = self.db.append_output(task_id, stream, data)?;
        self.hub.notify(task_id);
        Ok(seq)
    }

    /// 任务已写入终态：唤醒订阅者，宽限期后释放资源
    pub fn publish_done(&self, task_id: &str, status: TaskStatus) {
        debug!("[Live] Task {} finished as {}", task_id, status.as_str());
        self.hub.notify(task_id);

        let hub = self.hub.clone();
        let task_id = task_id.to_string();
        let grace = Duration::from_secs(self.settings.grace_period_secs);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    hub.release(&task_id);
                });
            }
            Err(_) => hub.release(&task_id),
        }
    }

    /// 当前持有唤醒通道的任务数
    pub fn active_channels(&self) -> usize {
        self.hub.len()
    }

    /// 订阅任务输出
    ///
    /// 每次调用都从头重放已持久化的输出，然后推送新输出，最后发送一次 Done。
    /// 任务已结束时立即重放并结束。
    pub fn subscribe(
        &self,
        task_id: &str,
    ) -> impl Stream<Item = Result<StreamEvent, StoreError>> + Send + 'static {
        let state = Subscription {
            db: self.db.clone(),
            hub: self.hub.clone(),
            task_id: task_id.to_string(),
            wake: Some(self.hub.subscribe(task_id)),
            poll_interval: Duration::from_millis(self.settings.poll_interval_ms.max(1)),
            cursor: 0,
            pending: VecDeque::new(),
            decoder: Utf8Decoder::default(),
            finished: false,
        };

        stream::unfold(state, |mut state| async move {
            let item = state.next_event().await?;
            if item.is_err() {
                state.finished = true;
                state.leave();
            }
            Some((item, state))
        })
    }
}

/// 单个订阅的状态
struct Subscription {
    db: Arc<Database>,
    hub: Arc<Hub>,
    task_id: String,
    wake: Option<watch::Receiver<u64>>,
    poll_interval: Duration,
    cursor: i64,
    pending: VecDeque<StreamEvent>,
    decoder: Utf8Decoder,
    finished: bool,
}

impl Subscription {
    async fn next_event(&mut self) -> Option<Result<StreamEvent, StoreError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                self.leave();
                return None;
            }

            match self.fill().await {
                Ok(true) => continue,
                Ok(false) => self.wait().await,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// 释放同进程唤醒通道
    fn leave(&mut self) {
        if let Some(rx) = self.wake.take() {
            self.hub.unsubscribe(&self.task_id, rx);
        }
    }

    /// 在阻塞线程池中查询数据库，不占用异步 worker 线程
    async fn query<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        let task_id = self.task_id.clone();
        tokio::task::spawn_blocking(move || f(&db, &task_id))
            .await
            .map_err(|e| StoreError::Background(e.to_string()))?
    }

    /// 读取新输出；任务结束时追加剩余输出和 Done。返回是否有新事件
    async fn fill(&mut self) -> Result<bool, StoreError> {
        if self.read_chunks().await? {
            return Ok(true);
        }

        let status = self
            .query(|db, id| db.task_status(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", self.task_id)))?;
        if !status.is_terminal() {
            return Ok(false);
        }

        // 读取状态之前可能又写入了输出块
        while self.read_chunks().await? {}
        for event in self.decoder.flush() {
            self.pending.push_back(event);
        }

        let task = self
            .query(|db, id| db.get_task(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", self.task_id)))?;
        self.pending.push_back(StreamEvent::Done {
            status: task.status,
            exit_code: task.exit_code(),
            error: task.error,
        });
        self.finished = true;
        self.leave();
        Ok(true)
    }

    async fn read_chunks(&mut self) -> Result<bool, StoreError> {
        let cursor = self.cursor;
        let chunks = self
            .query(move |db, id| db.output_after(id, cursor, FETCH_BATCH))
            .await?;
        let found = !chunks.is_empty();
        for chunk in chunks {
            self.cursor = chunk.seq;
            if let Some(event) = self.decoder.decode(chunk) {
                self.pending.push_back(event);
            }
        }
        Ok(found)
    }

    /// 等待唤醒或轮询间隔到期
    async fn wait(&mut self) {
        let Some(rx) = self.wake.as_mut() else {
            tokio::time::sleep(self.poll_interval).await;
            return;
        };
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    // 通道已释放，改为纯轮询
                    self.wake = None;
                }
            }
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}

impl Drop for Subscription {
    // 订阅者中途断开时同样释放
    fn drop(&mut self) {
        self.leave();
    }
}

/// 按输出流拼接被切断的 UTF-8 字符
#[derive(Default)]
struct Utf8Decoder {
    carry: HashMap<OutputStream, Vec<u8>>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: OutputChunk) -> Option<StreamEvent> {
        let mut buf = self.carry.remove(&chunk.stream).unwrap_or_default();
        buf.extend_from_slice(&chunk.data);

        let text = match std::str::from_utf8(&buf) {
            Ok(s) => s.to_string(),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.carry.insert(chunk.stream, buf[valid..].to_vec());
                String::from_utf8_lossy(&buf[..valid]).into_owned()
            }
            Err(_) => {
                warn!("[Live] Invalid UTF-8 in {} output", chunk.stream.as_str());
                String::from_utf8_lossy(&buf).into_owned()
            }
        };

        if text.is_empty() {
            return None;
        }
        Some(StreamEvent::Chunk {
            stream: chunk.stream,
            data: text,
        })
    }

    fn flush(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            if let Some(rest) = self.carry.remove(&stream) {
                if !rest.is_empty() {
                    events.push(StreamEvent::Chunk {
                        stream,
                        data: String::from_utf8_lossy(&rest).into_owned(),
                    });
                }
            }
        }
        events
    }
}
