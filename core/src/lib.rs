pub mod config;
pub mod error;
pub mod metadata;
pub mod mux;
pub mod net;
pub mod observer;
pub mod progress;
pub mod segment;
pub mod selection;
pub mod settings;
pub mod task;
pub mod transfer;


pub use crate::config::TransferConfig;
pub use crate::error::{CoreError, CoreResult};
pub use crate::metadata::{MediaInfo, MetadataClient, StreamDescriptor, YtDlpClient};
pub use crate::observer::{ChannelObserver, ObserverId, TaskObserver};
pub use crate::task::{DownloadTask, TaskId, TaskPhase, TaskSnapshot, TaskSpec, TaskStatus};
pub use crate::transfer::{SegmentedTransfer, TransferHandle, TransferOutcome};
