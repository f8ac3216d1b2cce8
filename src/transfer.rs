//! 分片上传处理器：会话创建、分片追加、完成与取消。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json as JsonResponse;
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::ApiError;
use crate::session::SessionRegistry;
use crate::storage::Storage;

/// 可选的分片字节偏移头；携带时会校验与已写入字节数的连续性。
pub const CHUNK_OFFSET_HEADER: &str = "X-Chunk-Offset";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StartUploadRequest {
    file_name: String,
    total_bytes: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StartUploadResponse {
    upload_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChunkQuery {
    upload_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FinishUploadRequest {
    upload_id: String,
    file_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CancelUploadRequest {
    upload_id: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProgressResponse {
    total_bytes: u64,
    transferred_bytes: u64,
    started_at: i64,
}

/// 创建上传会话并返回会话标识。
pub async fn start_upload(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
    Json(payload): Json<StartUploadRequest>,
) -> Result<JsonResponse<StartUploadResponse>, ApiError> {
    let name = normalize_name(&payload.file_name);
    if name.is_empty() {
        return Err(ApiError::BadRequest("fileName is required".into()));
    }
    storage.resolve_artifact_checked(&name, true).await?;

    let session = registry.start(name.clone(), payload.total_bytes);
    info!(
        upload_id = %session.id,
        name,
        total_bytes = payload.total_bytes,
        "start upload session"
    );

    Ok(JsonResponse(StartUploadResponse {
        upload_id: session.id.clone(),
    }))
}

/// 追加单个分片到会话的临时累积文件。
///
/// 写入与计数推进在会话锁内作为一个逻辑步骤完成；
/// 写入失败时截断回原长度，计数保持不变，便于调用方重试。
pub async fn upload_chunk(
    Query(ChunkQuery { upload_id }): Query<ChunkQuery>,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
    Extension(config): Extension<Arc<TransferConfig>>,
    body: AxumBody,
) -> Result<StatusCode, ApiError> {
    validate_upload_id(&upload_id)?;
    let session = registry.get(&upload_id).ok_or(ApiError::SessionNotFound)?;
    let _guard = session.append_guard().await;
    // Cancel or finish may have closed the session while we waited on the lock.
    if registry.get(&upload_id).is_none() {
        return Err(ApiError::SessionNotFound);
    }

    if let Some(value) = headers.get(CHUNK_OFFSET_HEADER) {
        let offset = value
            .to_str()
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| ApiError::BadRequest("X-Chunk-Offset is invalid".into()))?;
        let current = session.transferred();
        if offset != current {
            return Err(ApiError::Conflict(format!(
                "chunk offset {offset} does not match transferred bytes {current}"
            )));
        }
    }

    let spill = storage.spill_path(&upload_id);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spill)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let base_len = file
        .metadata()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .len();

    let written = match append_body(&mut file, body, config.max_chunk_size).await {
        Ok(written) => written,
        Err(err) => {
            // Roll the spill file back so the counter and disk stay in step.
            let _ = file.set_len(base_len).await;
            return Err(err);
        }
    };

    session.record_append(written);
    debug!(upload_id, bytes = written, transferred = session.transferred(), "chunk appended");
    Ok(StatusCode::OK)
}

async fn append_body(file: &mut File, body: AxumBody, limit: u64) -> Result<u64, ApiError> {
    let mut data_stream = BodyExt::into_data_stream(body);
    let mut written: u64 = 0;
    while let Some(chunk) = data_stream.next().await {
        let chunk = chunk.map_err(|err: AxumError| ApiError::Internal(err.to_string()))?;
        if chunk.is_empty() {
            continue;
        }
        written += chunk.len() as u64;
        if limit > 0 && written > limit {
            return Err(ApiError::BadRequest("chunk too large".into()));
        }
        file.write_all(&chunk)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }
    file.flush()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(written)
}

/// 原子地将累积文件提升为目标制品并关闭会话。
pub async fn finish_upload(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
    Extension(config): Extension<Arc<TransferConfig>>,
    Json(payload): Json<FinishUploadRequest>,
) -> Result<StatusCode, ApiError> {
    validate_upload_id(&payload.upload_id)?;
    let name = normalize_name(&payload.file_name);
    if name.is_empty() {
        return Err(ApiError::BadRequest("fileName is required".into()));
    }

    let session = registry
        .get(&payload.upload_id)
        .ok_or(ApiError::SessionNotFound)?;
    let _guard = session.append_guard().await;
    if registry.get(&payload.upload_id).is_none() {
        return Err(ApiError::SessionNotFound);
    }

    let spill = storage.spill_path(&payload.upload_id);
    if fs::metadata(&spill).await.is_err() {
        warn!(
            upload_id = payload.upload_id,
            name,
            "spill file missing at finish; upload bytes lost"
        );
        registry.remove(&payload.upload_id);
        return Err(ApiError::Internal("upload temp file missing".into()));
    }

    let target = match (&config.deploy_artifact, &config.deploy_dir) {
        (Some(artifact), Some(dir)) if *artifact == name => {
            warn!(upload_id = payload.upload_id, name, "replacing deployed artifact");
            dir.join(&name)
        }
        _ => storage.resolve_artifact_checked(&name, true).await?,
    };

    // A failed promote leaves the session (and spill file) intact for retry.
    storage
        .promote(&spill, &target, config.finish_overwrite)
        .await?;
    registry.remove(&payload.upload_id);

    info!(
        upload_id = payload.upload_id,
        name,
        transferred = session.transferred(),
        total_bytes = session.total_bytes,
        "upload finished"
    );
    Ok(StatusCode::OK)
}

/// 取消上传：丢弃临时文件与会话，可重复调用。
pub async fn cancel_upload(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
    Json(payload): Json<CancelUploadRequest>,
) -> Result<StatusCode, ApiError> {
    validate_upload_id(&payload.upload_id)?;

    let existed = match registry.get(&payload.upload_id) {
        Some(session) => {
            // Hold the append lock so no queued chunk write straddles the removal.
            let _guard = session.append_guard().await;
            registry.remove(&payload.upload_id);
            remove_spill(&storage, &payload.upload_id).await?;
            true
        }
        None => {
            remove_spill(&storage, &payload.upload_id).await?;
            false
        }
    };

    info!(upload_id = payload.upload_id, existed, "upload cancelled");
    Ok(StatusCode::OK)
}

async fn remove_spill(storage: &Storage, upload_id: &str) -> Result<(), ApiError> {
    match fs::remove_file(storage.spill_path(upload_id)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}

/// 查询会话进度；未知 id 返回全零记录（与历史行为保持一致）。
pub async fn upload_progress(
    Path(upload_id): Path<String>,
    Extension(registry): Extension<Arc<SessionRegistry>>,
) -> JsonResponse<ProgressResponse> {
    let response = match registry.get(&upload_id) {
        Some(session) => ProgressResponse {
            total_bytes: session.total_bytes,
            transferred_bytes: session.transferred(),
            started_at: session.started_at_ms(),
        },
        None => ProgressResponse::default(),
    };
    JsonResponse(response)
}

fn normalize_name(raw: &str) -> String {
    raw.trim().trim_start_matches(['/', '\\']).to_string()
}

fn validate_upload_id(upload_id: &str) -> Result<(), ApiError> {
    if upload_id.trim().is_empty() {
        return Err(ApiError::BadRequest("uploadId is required".into()));
    }
    if Uuid::parse_str(upload_id).is_err() {
        return Err(ApiError::BadRequest("uploadId is invalid".into()));
    }
    Ok(())
}
