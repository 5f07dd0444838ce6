//! # PACS QC
//!
//! 影像归档中 患者/检查/系列/实例 层次结构的质控结构变更引擎。
//!
//! - [`graph`]：实体图，负责层次结构的增删改查和结构性移动
//! - [`merge_path`]：患者合并路径解析
//! - [`rejection`]：实例的拒绝墓碑
//! - [`engine`]：合并、拆分、分段、拒绝、删除、属性更新等结构变更操作
//! - [`reaper`]：空系列、空检查回收
//! - [`context`] / [`history`]：操作上下文和审计记录
//! - [`store`]：带乐观并发控制的事务存储
//! - [`noniocm`]：Non-IOCM 替换对账消费者

pub mod command;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod graph;
pub mod history;
pub mod identity;
pub mod merge_path;
pub mod noniocm;
pub mod query_attributes;
pub mod reaper;
pub mod rejection;
pub mod store;

pub use command::{MergeRequest, PatientOperationRequest, QcCommand, SegmentRequest, SplitRequest};
pub use config::QcConfig;
pub use context::{AuditTrigger, QcOperationContext, QcRequest};
pub use dispatch::{ChannelDeleteDispatcher, DeleteDispatcher, DeleteRequest, DeleteScope, RecordingDeleteDispatcher};
pub use engine::StructuralChangeEngine;
pub use graph::EntityGraph;
pub use history::{HistoryLog, PatientCommand, QcOperation, QcUpdateHistory, UpdateScope};
pub use identity::{GraphPatientService, PatientIdentityService};
pub use merge_path::MergePathResolver;
pub use noniocm::{MessageHandler, MessageOutcome, NonIocmChangeRequestor, NonIocmMessage};
pub use reaper::EmptinessReaper;
pub use rejection::RejectionLedger;
pub use store::{ArchiveSnapshot, ArchiveState, ArchiveStore, Committed, Transaction};
