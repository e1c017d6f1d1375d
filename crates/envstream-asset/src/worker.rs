use crate::error::TransportError;
use crate::handle::RequestId;
use crate::hdr::{DecoderOptions, HdrDecoder};
use crate::protocol::WorkerMessage;
use crate::source::AssetSource;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 发给解码线程的请求
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub id: RequestId,
    pub path: String,
}

/// 解码线程发回的消息，带上对应请求的 id
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub id: RequestId,
    pub message: WorkerMessage,
}

/// 解码线程
///
/// 一个专用线程，按提交顺序逐个处理请求：打开数据源 -> 流式解码 -> 发回进度与结果。
/// 解码器和扫描线缓冲在线程内复用，不与其它线程共享可变状态。
///
/// # 线程生命周期
/// 线程的生命周期与 `DecodeWorker` 实例绑定。Drop 时：
/// 1. `request_sender` 被销毁，channel 断开。
/// 2. 线程处理完当前请求后 `recv()` 返回错误，退出循环。
/// 3. `drop` 调用 `join()` 等待线程退出。
pub struct DecodeWorker {
    name: String,
    request_sender: Option<Sender<DecodeRequest>>,
    event_receiver: Receiver<WorkerEvent>,

    thread: Option<thread::JoinHandle<()>>,
}

// new & init
impl DecodeWorker {
    pub fn spawn(
        worker_index: usize,
        source: Arc<dyn AssetSource>,
        options: DecoderOptions,
    ) -> Result<Self, TransportError> {
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<DecodeRequest>();
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<WorkerEvent>();

        let name = format!("Hdr-Decode-Worker-{worker_index}");
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut decoder = HdrDecoder::new(options);
                while let Ok(request) = req_rx.recv() {
                    let _span = profile_span!("DecodeWorker::decode");
                    if !decode_one(&mut decoder, source.as_ref(), request, &event_tx) {
                        break;
                    }
                }
                log::debug!("decode worker loop exited");
            })
            .map_err(|e| TransportError::WorkerSpawn { reason: e.to_string() })?;

        log::info!("spawned {name}");
        Ok(Self {
            name,
            request_sender: Some(req_tx),
            event_receiver: event_rx,
            thread: Some(thread),
        })
    }
}

impl DecodeWorker {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 非阻塞地提交一个请求
    pub fn submit(&self, id: RequestId, path: &str) -> Result<(), TransportError> {
        let not_delivered = || TransportError::RequestNotDelivered { path: path.to_string() };
        let sender = self.request_sender.as_ref().ok_or_else(not_delivered)?;
        sender
            .send(DecodeRequest {
                id,
                path: path.to_string(),
            })
            .map_err(|_| not_delivered())
    }

    /// 取出一条已到达的消息，没有则返回 `Ok(None)`
    pub fn try_recv(&self) -> Result<Option<WorkerEvent>, TransportError> {
        match self.event_receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    /// 最多等待 `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerEvent>, TransportError> {
        match self.event_receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        // 必须先 drop sender，否则线程中的 recv 会一直阻塞，导致 join 死锁
        self.request_sender = None;

        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("{} panicked", self.name);
        }
        log::info!("{} stopped", self.name);
    }
}

/// 处理一个请求，恰好发出一条终止消息；接收端已经不在时返回 false
fn decode_one(
    decoder: &mut HdrDecoder,
    source: &dyn AssetSource,
    request: DecodeRequest,
    event_tx: &Sender<WorkerEvent>,
) -> bool {
    let DecodeRequest { id, path } = request;
    log::debug!("decoding {path}");

    let message = match source.open(&path) {
        Err(e) => WorkerMessage::Error {
            detail: format!("failed to open {path}: {e}"),
        },
        Ok(stream) => {
            let on_progress = |fraction: f32| {
                let _ = event_tx.send(WorkerEvent {
                    id,
                    message: WorkerMessage::Progress { fraction },
                });
            };
            match decoder.decode(stream.reader, stream.total_len, on_progress) {
                Ok(image) => {
                    log::debug!("decoded {path}: {}x{}", image.width, image.height);
                    WorkerMessage::Data {
                        pixels: image.pixels,
                        width: image.width,
                        height: image.height,
                    }
                }
                Err(e) => WorkerMessage::Error {
                    detail: format!("{path}: {e}"),
                },
            }
        }
    };

    event_tx.send(WorkerEvent { id, message }).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use slotmap::SlotMap;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn hdr_bytes(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![image::Rgb([1.0f32, 0.5, 0.25]); (width * height) as usize];
        let mut bytes = Vec::new();
        image::codecs::hdr::HdrEncoder::new(&mut bytes)
            .encode(&pixels, width as usize, height as usize)
            .unwrap();
        bytes
    }

    fn spawn(source: MemorySource) -> DecodeWorker {
        DecodeWorker::spawn(0, Arc::new(source), DecoderOptions::default()).unwrap()
    }

    /// 收集消息直到终止消息
    fn collect_until_terminal(worker: &DecodeWorker) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        loop {
            let event = worker.recv_timeout(TIMEOUT).unwrap().expect("worker timed out");
            let terminal = event.message.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    #[test]
    fn test_decode_reports_progress_then_data() {
        let worker = spawn(MemorySource::new().with("env.hdr", hdr_bytes(16, 8)));
        let mut ids = SlotMap::<RequestId, ()>::with_key();
        let id = ids.insert(());

        worker.submit(id, "env.hdr").unwrap();
        let events = collect_until_terminal(&worker);

        assert!(events.iter().all(|e| e.id == id));
        let fractions: Vec<f32> = events
            .iter()
            .filter_map(|e| match e.message {
                WorkerMessage::Progress { fraction } => Some(fraction),
                _ => None,
            })
            .collect();
        assert_eq!(fractions.first(), Some(&0.0));
        assert_eq!(fractions.last(), Some(&1.0));
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));

        let Some(WorkerEvent {
            message: WorkerMessage::Data { pixels, width, height },
            ..
        }) = events.last()
        else {
            panic!("expected data, got {events:?}");
        };
        assert_eq!((*width, *height), (16, 8));
        assert_eq!(pixels.len(), 16 * 8 * 4);
        assert_eq!(worker.name(), "Hdr-Decode-Worker-0");
    }

    #[test]
    fn test_missing_asset_is_an_error_event() {
        let worker = spawn(MemorySource::new());
        let id = RequestId::default();
        worker.submit(id, "missing.hdr").unwrap();

        let events = collect_until_terminal(&worker);
        assert_eq!(events.len(), 1);
        let WorkerMessage::Error { detail } = &events[0].message else {
            panic!("expected error, got {events:?}");
        };
        assert!(detail.contains("missing.hdr"), "{detail}");
    }

    #[test]
    fn test_requests_are_processed_in_order() {
        let source = MemorySource::new()
            .with("bad.hdr", b"not an hdr".to_vec())
            .with("good.hdr", hdr_bytes(8, 8));
        let worker = spawn(source);
        let mut ids = SlotMap::<RequestId, ()>::with_key();
        let (bad, good) = (ids.insert(()), ids.insert(()));

        worker.submit(bad, "bad.hdr").unwrap();
        worker.submit(good, "good.hdr").unwrap();

        let first = collect_until_terminal(&worker);
        assert!(matches!(first.last().unwrap().message, WorkerMessage::Error { .. }));
        // 失败的解码不会汇报 1.0
        assert!(!first.iter().any(|e| e.message == WorkerMessage::Progress { fraction: 1.0 }));

        let second = collect_until_terminal(&worker);
        assert_eq!(second.last().unwrap().id, good);
        assert!(matches!(second.last().unwrap().message, WorkerMessage::Data { .. }));
    }

    #[test]
    fn test_try_recv_is_non_blocking() {
        let worker = spawn(MemorySource::new());
        assert_eq!(worker.try_recv().unwrap(), None);
    }

    #[test]
    fn test_drop_joins_thread_with_pending_requests() {
        let worker = spawn(MemorySource::new().with("env.hdr", hdr_bytes(8, 8)));
        for _ in 0..4 {
            worker.submit(RequestId::default(), "env.hdr").unwrap();
        }
        drop(worker);
    }
}
