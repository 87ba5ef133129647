//! On-demand data fetch for dehydrated placeholders.
//!
//! The filter invokes `FetchData` on pool threads, concurrently for distinct
//! files; each invocation is serviced independently and must always terminate
//! the request: success covering the streamed bytes, or one failed transfer
//! covering the full required length so the blocked reader wakes up.

use std::{
    collections::HashSet,
    io::{Read, Seek, SeekFrom},
    sync::{Arc, Mutex},
};

use crate::{
    activity::ActivityBus,
    error::{CloudErrorKind, Result},
    path::PathMap,
};

/// Streaming granularity. Kept page-aligned; the filter requires aligned
/// transfers everywhere but the final chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Receives chunk writes and progress for one fetch request.
pub trait TransferSink {
    fn transfer(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn progress(&mut self, total: u64, completed: u64);
    fn cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// All streamed; `bytes` may fall short of the request on early EOF.
    Success { bytes: u64 },
    /// The caller must answer with one failed transfer for the whole
    /// required range.
    Failed(CloudErrorKind),
}

/// Streams `[offset, offset + length)` from `source` into `sink` in
/// [`CHUNK_SIZE`] pieces, reporting progress before each chunk. A zero-length
/// request (or a file that ends at the offset) still produces exactly one
/// empty transfer so the request completes.
pub fn service_fetch<R: Read + Seek>(
    source: Option<&mut R>,
    offset: u64,
    length: u64,
    sink: &mut dyn TransferSink,
) -> FetchOutcome {
    let source = match source {
        Some(source) => source,
        None => return FetchOutcome::Failed(CloudErrorKind::ObjectNotFound),
    };

    match stream_range(source, offset, length, sink) {
        Ok(Some(bytes)) => {
            if bytes == 0 {
                if let Err(_e) = sink.transfer(offset, &[]) {
                    return FetchOutcome::Failed(CloudErrorKind::Unsuccessful);
                }
            }
            FetchOutcome::Success { bytes }
        }
        Ok(None) => FetchOutcome::Failed(CloudErrorKind::RequestCancelled),
        Err(_) => FetchOutcome::Failed(CloudErrorKind::Unsuccessful),
    }
}

/// Returns `Ok(Some(bytes_sent))`, or `Ok(None)` when the sink reported
/// cancellation between chunks.
fn stream_range<R: Read + Seek>(
    source: &mut R,
    offset: u64,
    length: u64,
    sink: &mut dyn TransferSink,
) -> Result<Option<u64>> {
    source.seek(SeekFrom::Start(offset))?;

    let end = offset.saturating_add(length);
    let mut position = offset;
    let mut buffer = vec![0u8; CHUNK_SIZE];

    while position < end {
        if sink.cancelled() {
            return Ok(None);
        }
        sink.progress(end, position);

        let want = CHUNK_SIZE.min((end - position) as usize);
        let read = source.read(&mut buffer[..want])?;
        if read == 0 {
            // Early EOF: the bytes streamed so far are the whole answer.
            break;
        }
        sink.transfer(position, &buffer[..read])?;
        position += read as u64;
    }

    sink.progress(end, position);
    Ok(Some(position - offset))
}

/// Services fetch callbacks for one connected sync root.
#[derive(Debug)]
pub struct HydrationHandler {
    paths: PathMap,
    activity: ActivityBus,
    /// Transfer keys whose fetch was cancelled by the filter. Consulted by
    /// the streamer between chunks.
    cancelled: Mutex<HashSet<i64>>,
}

impl HydrationHandler {
    pub fn new(paths: PathMap, activity: ActivityBus) -> Arc<Self> {
        Arc::new(Self {
            paths,
            activity,
            cancelled: Mutex::new(HashSet::new()),
        })
    }

    pub fn paths(&self) -> &PathMap {
        &self.paths
    }

    pub fn activity(&self) -> &ActivityBus {
        &self.activity
    }

    /// Records an advisory cancellation for a transfer key.
    pub fn cancel(&self, transfer_key: i64) {
        self.cancelled.lock().unwrap().insert(transfer_key);
    }

    /// Consulted by streaming sinks between chunks.
    pub fn is_cancelled(&self, transfer_key: i64) -> bool {
        self.cancelled.lock().unwrap().contains(&transfer_key)
    }

    #[cfg(windows)]
    fn clear_cancel(&self, transfer_key: i64) {
        self.cancelled.lock().unwrap().remove(&transfer_key);
    }
}

#[cfg(windows)]
pub use self::callbacks::callback_table;

#[cfg(windows)]
mod callbacks {
    use std::{
        ffi::c_void,
        fs::File,
        io, mem, ptr, slice,
        sync::{Arc, Weak},
    };

    use tracing::{debug, warn};
    use windows::Win32::{
        Foundation::{NTSTATUS, STATUS_SUCCESS},
        Storage::CloudFilters::{
            self, CfExecute, CfReportProviderProgress, CF_CALLBACK_INFO, CF_CALLBACK_PARAMETERS,
            CF_CALLBACK_REGISTRATION, CF_CONNECTION_KEY, CF_OPERATION_INFO,
            CF_OPERATION_PARAMETERS, CF_OPERATION_PARAMETERS_0, CF_OPERATION_PARAMETERS_0_6,
        },
    };

    use super::{service_fetch, FetchOutcome, HydrationHandler, TransferSink};
    use crate::{
        activity::ActivityKind,
        error::{CloudErrorKind, Result},
        placeholder::identity,
    };

    /// The two hydration callbacks plus the required sentinel entry. The
    /// returned table must stay alive for the whole connection.
    pub fn callback_table() -> [CF_CALLBACK_REGISTRATION; 3] {
        [
            CF_CALLBACK_REGISTRATION {
                Type: CloudFilters::CF_CALLBACK_TYPE_FETCH_DATA,
                Callback: Some(on_fetch_data),
            },
            CF_CALLBACK_REGISTRATION {
                Type: CloudFilters::CF_CALLBACK_TYPE_CANCEL_FETCH_DATA,
                Callback: Some(on_cancel_fetch_data),
            },
            CF_CALLBACK_REGISTRATION {
                Type: CloudFilters::CF_CALLBACK_TYPE_NONE,
                Callback: None,
            },
        ]
    }

    unsafe extern "system" fn on_fetch_data(
        info: *const CF_CALLBACK_INFO,
        params: *const CF_CALLBACK_PARAMETERS,
    ) {
        let Some(handler) = handler_from_info(info) else {
            return;
        };

        let fetch = (*params).Anonymous.FetchData;
        let offset = fetch.RequiredFileOffset as u64;
        let length = fetch.RequiredLength as u64;
        let keys = Keys {
            connection: (*info).ConnectionKey.0,
            transfer: (*info).TransferKey,
        };
        let blob = slice::from_raw_parts(
            (*info).FileIdentity as *const u8,
            (*info).FileIdentityLength as usize,
        );

        handler.serve(keys, identity::decode(blob), offset, length);
    }

    unsafe extern "system" fn on_cancel_fetch_data(
        info: *const CF_CALLBACK_INFO,
        _params: *const CF_CALLBACK_PARAMETERS,
    ) {
        if let Some(handler) = handler_from_info(info) {
            debug!(transfer_key = (*info).TransferKey, "fetch cancelled");
            handler.cancel((*info).TransferKey);
        }
    }

    /// Recovers the handler from the raw callback context without taking
    /// ownership of the connection's weak reference.
    unsafe fn handler_from_info(info: *const CF_CALLBACK_INFO) -> Option<Arc<HydrationHandler>> {
        let weak = Weak::from_raw((*info).CallbackContext as *const HydrationHandler);
        let strong = weak.upgrade();
        match &strong {
            Some(_) => {
                let _ = Weak::into_raw(weak);
            }
            // Connection torn down; the weak count is released with it.
            None => drop(weak),
        }
        strong
    }

    #[derive(Clone, Copy)]
    struct Keys {
        connection: i64,
        transfer: i64,
    }

    impl HydrationHandler {
        fn serve(
            self: &Arc<Self>,
            keys: Keys,
            relative: Option<std::path::PathBuf>,
            offset: u64,
            length: u64,
        ) {
            let mut sink = CfSink {
                handler: self,
                keys,
            };

            let (outcome, relative) = match relative {
                None => (FetchOutcome::Failed(CloudErrorKind::ObjectNotFound), None),
                Some(rel) => {
                    let server_abs = self.paths().server_abs(&rel);
                    match File::open(&server_abs) {
                        Ok(mut file) => (
                            service_fetch(Some(&mut file), offset, length, &mut sink),
                            Some(rel),
                        ),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {
                            (FetchOutcome::Failed(CloudErrorKind::ObjectNotFound), Some(rel))
                        }
                        Err(_) => (FetchOutcome::Failed(CloudErrorKind::Unsuccessful), Some(rel)),
                    }
                }
            };

            match outcome {
                FetchOutcome::Success { bytes } => {
                    debug!(relative = ?relative, bytes, "hydrated");
                    if let Some(rel) = relative {
                        self.activity.completed(ActivityKind::Downloaded, rel);
                    }
                }
                FetchOutcome::Failed(kind) => {
                    warn!(relative = ?relative, ?kind, "fetch failed");
                    if let Err(e) = transfer(keys, kind.into(), &[], offset, length as i64) {
                        warn!(error = %e, "could not deliver failure transfer");
                    }
                }
            }
            self.clear_cancel(keys.transfer);
        }
    }

    struct CfSink<'a> {
        handler: &'a HydrationHandler,
        keys: Keys,
    }

    impl TransferSink for CfSink<'_> {
        fn transfer(&mut self, offset: u64, data: &[u8]) -> Result<()> {
            transfer(self.keys, STATUS_SUCCESS, data, offset, data.len() as i64)?;
            Ok(())
        }

        fn progress(&mut self, total: u64, completed: u64) {
            let result = unsafe {
                CfReportProviderProgress(
                    CF_CONNECTION_KEY(self.keys.connection),
                    self.keys.transfer,
                    total as i64,
                    completed as i64,
                )
            };
            if let Err(e) = result {
                debug!(error = %e, "progress report dropped");
            }
        }

        fn cancelled(&self) -> bool {
            self.handler.is_cancelled(self.keys.transfer)
        }
    }

    fn transfer(
        keys: Keys,
        status: NTSTATUS,
        data: &[u8],
        offset: u64,
        length: i64,
    ) -> windows::core::Result<()> {
        // The filter rejects null buffers even for empty or failed transfers.
        let fallback = [0u8; 1];
        let buffer = if data.is_empty() {
            fallback.as_ptr()
        } else {
            data.as_ptr()
        };

        let op_info = CF_OPERATION_INFO {
            StructSize: mem::size_of::<CF_OPERATION_INFO>() as u32,
            Type: CloudFilters::CF_OPERATION_TYPE_TRANSFER_DATA,
            ConnectionKey: CF_CONNECTION_KEY(keys.connection),
            TransferKey: keys.transfer,
            CorrelationVector: ptr::null(),
            SyncStatus: ptr::null(),
            RequestKey: CloudFilters::CF_REQUEST_KEY_DEFAULT as i64,
        };
        let mut op_params = CF_OPERATION_PARAMETERS {
            ParamSize: (mem::size_of::<CF_OPERATION_PARAMETERS_0_6>()
                + mem::offset_of!(CF_OPERATION_PARAMETERS, Anonymous))
                as u32,
            Anonymous: CF_OPERATION_PARAMETERS_0 {
                TransferData: CF_OPERATION_PARAMETERS_0_6 {
                    Flags: CloudFilters::CF_OPERATION_TRANSFER_DATA_FLAG_NONE,
                    CompletionStatus: status,
                    Buffer: buffer as *mut c_void,
                    Offset: offset as i64,
                    Length: length,
                },
            },
        };

        unsafe { CfExecute(&op_info as *const _, &mut op_params as *mut _) }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        chunks: Vec<(u64, Vec<u8>)>,
        progress: Vec<(u64, u64)>,
        cancel_after: Option<usize>,
    }

    impl TransferSink for RecordingSink {
        fn transfer(&mut self, offset: u64, data: &[u8]) -> Result<()> {
            self.chunks.push((offset, data.to_vec()));
            Ok(())
        }

        fn progress(&mut self, total: u64, completed: u64) {
            self.progress.push((total, completed));
        }

        fn cancelled(&self) -> bool {
            self.cancel_after
                .is_some_and(|after| self.chunks.len() >= after)
        }
    }

    #[test]
    fn streams_in_chunks_with_progress() {
        let data = vec![7u8; CHUNK_SIZE + 100];
        let mut source = Cursor::new(data.clone());
        let mut sink = RecordingSink::default();

        let outcome = service_fetch(Some(&mut source), 0, data.len() as u64, &mut sink);

        assert_eq!(
            outcome,
            FetchOutcome::Success {
                bytes: data.len() as u64
            }
        );
        assert_eq!(sink.chunks.len(), 2);
        assert_eq!(sink.chunks[0].1.len(), CHUNK_SIZE);
        assert_eq!(sink.chunks[1], (CHUNK_SIZE as u64, vec![7u8; 100]));
        // Final progress reports the full range as completed.
        assert_eq!(
            sink.progress.last(),
            Some(&(data.len() as u64, data.len() as u64))
        );
    }

    #[test]
    fn respects_offset() {
        let mut source = Cursor::new((0u8..100).collect::<Vec<_>>());
        let mut sink = RecordingSink::default();

        let outcome = service_fetch(Some(&mut source), 10, 5, &mut sink);

        assert_eq!(outcome, FetchOutcome::Success { bytes: 5 });
        assert_eq!(sink.chunks, vec![(10, vec![10, 11, 12, 13, 14])]);
    }

    #[test]
    fn zero_byte_request_sends_single_empty_transfer() {
        let mut source = Cursor::new(Vec::<u8>::new());
        let mut sink = RecordingSink::default();

        let outcome = service_fetch(Some(&mut source), 0, 0, &mut sink);

        assert_eq!(outcome, FetchOutcome::Success { bytes: 0 });
        assert_eq!(sink.chunks, vec![(0, vec![])]);
    }

    #[test]
    fn early_eof_succeeds_with_fewer_bytes() {
        let mut source = Cursor::new(vec![1u8; 50]);
        let mut sink = RecordingSink::default();

        let outcome = service_fetch(Some(&mut source), 0, 1_000, &mut sink);

        assert_eq!(outcome, FetchOutcome::Success { bytes: 50 });
        assert_eq!(sink.chunks.len(), 1);
    }

    #[test]
    fn missing_source_reports_object_not_found() {
        let mut sink = RecordingSink::default();
        let outcome = service_fetch::<Cursor<Vec<u8>>>(None, 0, 100, &mut sink);
        assert_eq!(outcome, FetchOutcome::Failed(CloudErrorKind::ObjectNotFound));
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn cancellation_stops_the_stream() {
        let data = vec![0u8; CHUNK_SIZE * 4];
        let mut source = Cursor::new(data.clone());
        let mut sink = RecordingSink {
            cancel_after: Some(1),
            ..Default::default()
        };

        let outcome = service_fetch(Some(&mut source), 0, data.len() as u64, &mut sink);

        assert_eq!(
            outcome,
            FetchOutcome::Failed(CloudErrorKind::RequestCancelled)
        );
        assert_eq!(sink.chunks.len(), 1);
    }
}
