//! 质控命令回放程序
//!
//! 加载归档快照，在事务中逐条执行质控命令，可选地运行删除工作者完成删除请求，
//! 最后输出新的快照、每条命令的操作上下文和各检查的派生查询属性。

use anyhow::{Context, Result};
use clap::Parser;
use pacs_core::{PacsError, StudyQueryAttributes, StudyUid};
use pacs_qc::dispatch::run_delete_worker;
use pacs_qc::{
    ArchiveSnapshot, ArchiveStore, AuditTrigger, ChannelDeleteDispatcher, DeleteDispatcher, QcCommand, QcConfig,
    QcOperationContext, QcRequest, RecordingDeleteDispatcher, StructuralChangeEngine,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 质控回放命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-qc-server")]
#[command(about = "PACS 质控结构变更命令回放")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 归档快照（JSON），缺省为空归档
    #[arg(short, long)]
    graph: Option<String>,

    /// 质控命令列表（JSON 数组）
    #[arg(short, long)]
    requests: String,

    /// 结果输出路径，缺省输出到标准输出
    #[arg(short, long)]
    output: Option<String>,

    /// 审计来源
    #[arg(short, long, default_value = "INTERACTIVE")]
    trigger: String,

    /// 回放结束前完成所有删除请求
    #[arg(long)]
    auto_confirm_deletes: bool,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// 单条命令的执行结果
#[derive(Debug, Serialize)]
struct CommandReport {
    index: usize,
    op: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<QcOperationContext>,
}

/// 回放后的检查概览
#[derive(Debug, Serialize)]
struct StudySummary {
    study_uid: StudyUid,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    accession_number: Option<String>,
    #[serde(flatten)]
    aggregates: StudyQueryAttributes,
}

#[derive(Debug, Serialize)]
struct ReplayReport {
    commands: Vec<CommandReport>,
    studies: Vec<StudySummary>,
    snapshot: ArchiveSnapshot,
}

fn status_of(error: &PacsError) -> &'static str {
    match error {
        PacsError::NotFound(_) => "not_found",
        PacsError::OperationNotPermitted(_) => "not_permitted",
        PacsError::CircularMerge(_) => "circular_merge",
        PacsError::NonUniquePatient(_) | PacsError::PatientMerged(_) => "patient_identity",
        PacsError::Conflict(_) => "conflict",
        _ => "failed",
    }
}

fn execute(
    engine: &StructuralChangeEngine,
    store: &ArchiveStore,
    req: &QcRequest<'_>,
    index: usize,
    command: &QcCommand,
) -> CommandReport {
    const MAX_ATTEMPTS: usize = 3;
    let mut attempt = 1;
    let result = loop {
        let mut tx = store.begin();
        let result = command
            .execute(engine, &mut tx, req)
            .and_then(|context| engine.commit(tx).map(|_| context));
        match result {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                warn!("命令 #{} {} 第 {} 次尝试冲突: {}", index, command.name(), attempt, e);
                attempt += 1;
            }
            result => break result,
        }
    };

    match result {
        Ok(context) => CommandReport {
            index,
            op: command.name(),
            status: if context.is_some() { "applied" } else { "skipped" },
            error: None,
            context,
        },
        Err(e) => {
            warn!("命令 #{} {} 执行失败: {}", index, command.name(), e);
            CommandReport {
                index,
                op: command.name(),
                status: status_of(&e),
                error: Some(e.to_string()),
                context: None,
            }
        }
    }
}

/// 在只读事务中计算各检查的派生查询属性，事务结束时回滚
fn summarize_studies(
    engine: &StructuralChangeEngine,
    store: &ArchiveStore,
    req: &QcRequest<'_>,
    snapshot: &ArchiveSnapshot,
) -> pacs_core::Result<Vec<StudySummary>> {
    let mut tx = store.begin();
    let mut summaries = Vec::with_capacity(snapshot.graph.studies.len());
    for study in &snapshot.graph.studies {
        summaries.push(StudySummary {
            study_uid: study.study_uid.clone(),
            description: study.description().map(str::to_string),
            accession_number: study.accession_number().map(str::to_string),
            aggregates: engine.study_query_attributes(&mut tx, req, &study.study_uid)?,
        });
    }
    tx.rollback();
    summaries.sort_by(|a, b| a.study_uid.cmp(&b.study_uid));
    Ok(summaries)
}

async fn load_store(path: Option<&str>) -> Result<ArchiveStore> {
    let Some(path) = path else {
        return Ok(ArchiveStore::default());
    };
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取归档快照 {} 失败", path))?;
    let snapshot: ArchiveSnapshot =
        serde_json::from_str(&data).with_context(|| format!("解析归档快照 {} 失败", path))?;
    Ok(ArchiveStore::from_snapshot(snapshot)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    info!("启动质控命令回放...");

    let config = Arc::new(QcConfig::load(args.config.as_deref()).context("加载配置失败")?);
    let trigger: AuditTrigger = serde_json::from_value(serde_json::Value::String(args.trigger.clone()))
        .with_context(|| format!("无效的审计来源 {}", args.trigger))?;
    let store = load_store(args.graph.as_deref()).await?;

    let data = tokio::fs::read_to_string(&args.requests)
        .await
        .with_context(|| format!("读取命令文件 {} 失败", args.requests))?;
    let commands: Vec<QcCommand> =
        serde_json::from_str(&data).with_context(|| format!("解析命令文件 {} 失败", args.requests))?;
    info!("加载 {} 条质控命令", commands.len());

    let channel = args.auto_confirm_deletes.then(ChannelDeleteDispatcher::new);
    let (engine, dispatcher, worker) = match channel {
        Some((dispatcher, receiver)) => {
            let dispatcher = Arc::new(dispatcher);
            let engine = Arc::new(StructuralChangeEngine::new(dispatcher.clone() as Arc<dyn DeleteDispatcher>));
            let worker = tokio::spawn(run_delete_worker(engine.clone(), store.clone(), config.clone(), receiver));
            (engine, Some(dispatcher), Some(worker))
        }
        None => (
            Arc::new(StructuralChangeEngine::new(Arc::new(RecordingDeleteDispatcher::new()))),
            None,
            None,
        ),
    };

    if dispatcher.is_some() {
        // 快照中遗留的删除请求
        let pending = engine.redispatch_pending(&store).context("重新分发删除请求失败")?;
        if pending > 0 {
            info!("重新分发 {} 个遗留删除请求", pending);
        }
    }

    let req = QcRequest::new(trigger, &config);
    let mut reports = Vec::with_capacity(commands.len());
    for (index, command) in commands.iter().enumerate() {
        reports.push(execute(&engine, &store, &req, index, command));
    }

    if let (Some(dispatcher), Some(worker)) = (dispatcher, worker) {
        dispatcher.close();
        let completed = worker.await.context("删除工作者异常退出")?;
        info!("删除工作者完成 {} 个删除请求", completed);
    }

    let applied = reports.iter().filter(|r| r.status == "applied").count();
    let failed = reports.iter().filter(|r| r.error.is_some()).count();
    info!("回放结束: 成功 {} 条, 失败 {} 条, 跳过 {} 条", applied, failed, reports.len() - applied - failed);

    let snapshot = store.snapshot();
    let studies = summarize_studies(&engine, &store, &req, &snapshot).context("计算查询属性失败")?;
    let report = ReplayReport {
        commands: reports,
        studies,
        snapshot,
    };
    let json = serde_json::to_string_pretty(&report).context("序列化回放结果失败")?;
    match &args.output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("写入结果 {} 失败", path))?;
            info!("结果已写入 {}", path);
        }
        None => println!("{}", json),
    }

    if failed > 0 {
        error!("{} 条命令执行失败", failed);
    }
    Ok(())
}
