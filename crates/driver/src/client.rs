//! Client-facing engine (§6 bridge): translates `DriverRequest` values into
//! device operations driven through [`crate::mmm::MmmEngine`] and
//! [`crate::jobs`], and produces `DriverResponse` values. This is the
//! single place that knows how to turn one external request into the
//! sequence of lower-level calls that satisfies it.
//!
//! Every credential/data-touching request opens its own short management-mode
//! session (enter, edit the clone, repair, diff, write back, commit) unless
//! the caller already holds one open via `StartMmm`; `ExitMmm` ends that
//! explicit session. Only one session — explicit or ephemeral — exists at a
//! time, matching §5's "MMM session is an exclusive resource" rule.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use shared::node::encode_date;
use shared::protocol::{Command, Limits, NodeSizes};
use shared::rpc::{DriverRequest, DriverResponse, ProgressUpdate, RequestId};

use crate::codec;
use crate::dispatcher::DispatcherHandle;
use crate::error::{DriverError, DriverResult};
use crate::graph::{CredChildNode, DataChildNode, NodeAddr, NodeBody, NodeGraph, NodeId, ParentNode};
use crate::jobs::{Job, JobEngineHandle, JobId, JobOutcome, JobState, Step, StepOutcome};
use crate::mmm::{MmmEngine, Session};

/// A 4-byte length prefix precedes every data blob's chunked representation
/// on the wire; there is no independent "total size" node field to read it
/// back from otherwise (driver convention, not a documented device layout).
const DATA_LENGTH_PREFIX: usize = 4;

/// Arbitrary device-date epoch: the on-device compact date field's
/// `year_since_base` component has no documented base year, so this driver
/// picks one (see DESIGN.md) purely to have `set_credential` write something
/// meaningful into `date_created`/`date_used`.
const DATE_BASE_YEAR: i64 = 2000;

/// Bytes returned per `GetRandomNumber` round trip; chunked across several
/// job steps for requests larger than this.
const RANDOM_CHUNK: usize = 32;

pub struct Client {
    dispatcher: DispatcherHandle,
    jobs: JobEngineHandle,
    mmm: MmmEngine,
    sizes: NodeSizes,
    limits: Limits,
    bundle_version: u32,
    session: Option<(RequestId, Session)>,
    cancel_flags: HashMap<RequestId, Arc<std::sync::atomic::AtomicBool>>,
    job_ids: HashMap<RequestId, JobId>,
}

impl Client {
    pub fn new(
        dispatcher: DispatcherHandle,
        jobs: JobEngineHandle,
        sizes: NodeSizes,
        limits: Limits,
        failure_threshold: u32,
        bundle_version: u32,
    ) -> Self {
        let mmm = MmmEngine::new(dispatcher.clone(), sizes, limits, failure_threshold);
        Self {
            dispatcher,
            jobs,
            mmm,
            sizes,
            limits,
            bundle_version,
            session: None,
            cancel_flags: HashMap::new(),
            job_ids: HashMap::new(),
        }
    }

    /// Handles one request, reporting MMM-session progress through
    /// `progress` as `{total, current, msg, msg_args}` (§7's user-visible
    /// progress shape). `progress` is a no-op for requests that don't open a
    /// session.
    pub async fn handle(&mut self, request: DriverRequest, mut progress: impl FnMut(ProgressUpdate)) -> DriverResponse {
        let reqid = request.reqid().to_string();
        let result = self.dispatch(request, &mut progress).await;
        match result {
            Ok(response) => response,
            Err(error) => {
                let (kind, message) = error.into_rpc();
                DriverResponse::Error { reqid, kind, message }
            }
        }
    }

    async fn dispatch(&mut self, request: DriverRequest, progress: &mut impl FnMut(ProgressUpdate)) -> DriverResult<DriverResponse> {
        match request {
            DriverRequest::Cancel { reqid } => {
                if let Some(flag) = self.cancel_flags.get(&reqid) {
                    flag.store(true, Ordering::Relaxed);
                }
                if let Some(job_id) = self.job_ids.get(&reqid).copied() {
                    self.jobs.cancel(job_id).await;
                }
                Ok(DriverResponse::Ack)
            }
            DriverRequest::Lock { .. } => {
                self.simple_command(Command::LockDevice).await?;
                Ok(DriverResponse::Ack)
            }
            DriverRequest::ResetCard { .. } => {
                self.simple_command(Command::ResetCard).await?;
                Ok(DriverResponse::Ack)
            }
            DriverRequest::GetRandom { reqid, count } => self.get_random(reqid, count).await,
            DriverRequest::StartMmm { reqid, want_data } => self.start_mmm(reqid, want_data, progress).await,
            DriverRequest::ExitMmm { reqid, commit } => self.exit_mmm(reqid, commit, progress).await,
            DriverRequest::IntegrityCheck { reqid } => self.integrity_check(reqid, progress).await,
            DriverRequest::GetCredential { reqid, service, login, fallback_service } => {
                self.get_credential(reqid, &service, login.as_deref(), fallback_service.as_deref(), progress)
                    .await
            }
            DriverRequest::SetCredential { reqid, service, login, password, description, set_description } => {
                self.set_credential(reqid, &service, &login, &password, description.as_deref(), set_description, progress)
                    .await
            }
            DriverRequest::GetDataNode { reqid, service, fallback_service } => {
                self.get_data_node(reqid, &service, fallback_service.as_deref(), progress).await
            }
            DriverRequest::SetDataNode { reqid, service, data } => {
                self.set_data_node(reqid, &service, &data, progress).await
            }
            DriverRequest::DeleteCredentials { reqid, services } => {
                self.delete_from_chain(reqid, &services, true, progress).await
            }
            DriverRequest::DeleteData { reqid, services } => {
                self.delete_from_chain(reqid, &services, false, progress).await
            }
            DriverRequest::Export { reqid, encryption_name } => self.export(reqid, &encryption_name, progress).await,
            DriverRequest::Import { reqid, file_bytes, no_delete } => {
                self.import(reqid, &file_bytes, no_delete, progress).await
            }
        }
    }

    async fn simple_command(&self, command: Command) -> DriverResult<()> {
        let (_c, status) = self.dispatcher.send(command, Vec::new()).await?;
        if status.first().copied().unwrap_or(1) != 0 {
            return Err(DriverError::DeviceRejected { command: command.code() });
        }
        Ok(())
    }

    /// Chunks a `GetRandomNumber` request across as many job steps as
    /// needed — the one place in this crate where the generic job engine
    /// (rather than `MmmEngine`'s bespoke async sequencing) drives the
    /// device, since the step count here is known up front from `count`
    /// alone, unlike an MMM scan whose length depends on what's read.
    async fn get_random(&mut self, reqid: RequestId, count: usize) -> DriverResult<DriverResponse> {
        if count == 0 {
            return Ok(DriverResponse::RandomBytes { data: Vec::new() });
        }
        let chunks = count.div_ceil(RANDOM_CHUNK);
        let mut steps = Vec::with_capacity(chunks);
        for _ in 0..chunks {
            steps.push(Step {
                build: Box::new(|_state| (Command::GetRandomNumber, vec![RANDOM_CHUNK as u8])),
                handle: Box::new(|state, (_command, payload)| {
                    let mut acc: Vec<u8> = state.take("random").unwrap_or_default();
                    acc.extend_from_slice(&payload);
                    state.set("random", acc);
                    StepOutcome::Continue
                }),
            });
        }
        if let Some(last) = steps.last_mut() {
            last.handle = Box::new(|state, (_command, payload)| {
                let mut acc: Vec<u8> = state.take("random").unwrap_or_default();
                acc.extend_from_slice(&payload);
                state.set("random", acc);
                StepOutcome::StopSuccess
            });
        }

        let job_id = self.jobs.alloc_id();
        let (job, rx) = Job::new(job_id, steps, JobState::default());
        self.job_ids.insert(reqid.clone(), job_id);
        self.jobs.enqueue(job).await;
        let outcome = rx.await.map_err(|_| DriverError::TransportLost)?;
        self.job_ids.remove(&reqid);
        match outcome {
            JobOutcome::Success(mut state) => {
                let mut data: Vec<u8> = state.take("random").unwrap_or_default();
                data.truncate(count);
                Ok(DriverResponse::RandomBytes { data })
            }
            JobOutcome::Failure { error, .. } => Err(error),
            JobOutcome::Cancelled => Err(DriverError::Cancelled),
        }
    }

    fn register_session(&mut self, reqid: RequestId, session: Session) {
        self.cancel_flags.insert(reqid.clone(), session.cancel_handle());
        self.session = Some((reqid, session));
    }

    async fn start_mmm(&mut self, reqid: RequestId, _want_data: bool, progress: &mut impl FnMut(ProgressUpdate)) -> DriverResult<DriverResponse> {
        if self.session.is_some() {
            return Err(DriverError::protocol("management mode already active"));
        }
        progress(ProgressUpdate { total: 1, current: 0, msg: "entering management mode".into(), msg_args: vec![] });
        let session = self.mmm.enter().await?;
        progress(ProgressUpdate { total: 1, current: 1, msg: "management mode active".into(), msg_args: vec![] });
        self.register_session(reqid, session);
        Ok(DriverResponse::Ack)
    }

    async fn exit_mmm(&mut self, reqid: RequestId, commit: bool, progress: &mut impl FnMut(ProgressUpdate)) -> DriverResult<DriverResponse> {
        let Some(session) = self.take_owned_session() else {
            return Err(DriverError::protocol("no management-mode session is active"));
        };
        let _ = reqid;
        self.finish_session(session, commit, progress).await?;
        Ok(DriverResponse::Ack)
    }

    /// Takes whichever session is open regardless of owning reqid — used by
    /// `ExitMmm`, which may legitimately be called with its own reqid rather
    /// than the one that opened the session.
    fn take_owned_session(&mut self) -> Option<Session> {
        let (owner, session) = self.session.take()?;
        self.cancel_flags.remove(&owner);
        Some(session)
    }

    async fn finish_session(&self, mut session: Session, commit: bool, progress: &mut impl FnMut(ProgressUpdate)) -> DriverResult<NodeGraph> {
        if commit {
            self.mmm.integrity_check_and_repair(&mut session.clone);
            progress(ProgressUpdate { total: 3, current: 1, msg: "repaired".into(), msg_args: vec![] });
            self.mmm.allocate(&mut session).await?;
            progress(ProgressUpdate { total: 3, current: 2, msg: "addresses allocated".into(), msg_args: vec![] });
            self.mmm.diff_and_write_back(&mut session).await?;
            progress(ProgressUpdate { total: 3, current: 3, msg: "written back".into(), msg_args: vec![] });
            self.mmm.commit(session).await
        } else {
            self.mmm.abort(session).await;
            Err(DriverError::Cancelled)
        }
    }

    /// Runs `body` against a freshly entered, ephemeral session, committing
    /// (or aborting, on error) before returning. Used by every request that
    /// doesn't need to hold the session open across multiple client calls.
    async fn with_ephemeral_session<T>(
        &mut self,
        reqid: &str,
        progress: &mut impl FnMut(ProgressUpdate),
        body: impl FnOnce(&mut Session) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut session = self.mmm.enter().await?;
        self.cancel_flags.insert(reqid.to_string(), session.cancel_handle());
        let outcome = body(&mut session);
        let result = match outcome {
            Ok(value) => match self.finish_session(session, true, progress).await {
                Ok(_) => Ok(value),
                Err(e) => Err(e),
            },
            Err(e) => {
                self.mmm.abort(session).await;
                Err(e)
            }
        };
        self.cancel_flags.remove(reqid);
        result
    }

    /// Like [`Self::with_ephemeral_session`] but never writes back — used by
    /// read-only requests (`GetCredential`, `GetDataNode`) so an unrelated
    /// integrity repair never gets attributed to a read.
    async fn with_read_only_session<T>(
        &mut self,
        reqid: &str,
        body: impl FnOnce(&mut Session) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut session = self.mmm.enter().await?;
        self.cancel_flags.insert(reqid.to_string(), session.cancel_handle());
        let outcome = body(&mut session);
        self.mmm.abort(session).await;
        self.cancel_flags.remove(reqid);
        outcome
    }

    async fn integrity_check(&mut self, reqid: RequestId, progress: &mut impl FnMut(ProgressUpdate)) -> DriverResult<DriverResponse> {
        self.with_ephemeral_session(&reqid, progress, |_session| Ok(())).await?;
        let (_c, payload) = self.dispatcher.send(Command::GetMemoryStats, Vec::new()).await?;
        if payload.len() < 9 || payload[0] != 0 {
            return Err(DriverError::protocol("GetMemoryStats reply malformed"));
        }
        let free_blocks = u32::from_le_bytes(payload[1..5].try_into().unwrap());
        let total_blocks = u32::from_le_bytes(payload[5..9].try_into().unwrap());
        Ok(DriverResponse::IntegrityReport { free_blocks, total_blocks })
    }

    fn find_parent(session: &Session, chain_head: Option<NodeId>, service: &str, fallback: Option<&str>) -> DriverResult<NodeId> {
        session
            .clone
            .graph
            .find_by_service(chain_head, service)
            .or_else(|| fallback.and_then(|f| session.clone.graph.find_by_service(chain_head, f)))
            .ok_or_else(|| DriverError::protocol(format!("no node found for service {service:?}")))
    }

    async fn get_credential(
        &mut self,
        reqid: RequestId,
        service: &str,
        login: Option<&str>,
        fallback_service: Option<&str>,
        progress: &mut impl FnMut(ProgressUpdate),
    ) -> DriverResult<DriverResponse> {
        let _ = progress;
        let (service_name, login_name, description, ciphertext) = self
            .with_read_only_session(&reqid, |session| {
                let parent_id = Self::find_parent(session, session.clone.cred_start, service, fallback_service)?;
                let Some(NodeBody::CredParent(parent)) = session.clone.graph.get(parent_id) else {
                    return Err(DriverError::protocol("resolved node is not a credential parent"));
                };
                let service_name = parent.service_name.clone();
                let child_id = match login {
                    Some(login) => session
                        .clone
                        .graph
                        .find_child_by_login_under(parent_id, login)
                        .ok_or_else(|| DriverError::protocol(format!("no login {login:?} under {service_name:?}")))?,
                    None => parent
                        .first_child
                        .ok_or_else(|| DriverError::protocol(format!("{service_name:?} has no children")))?,
                };
                let Some(NodeBody::CredChild(child)) = session.clone.graph.get(child_id) else {
                    return Err(DriverError::protocol("resolved node is not a credential child"));
                };
                Ok((service_name, child.login.clone(), child.description.clone(), child.password_enc.clone()))
            })
            .await?;

        let password = self.decrypt_password(&ciphertext).await?;
        Ok(DriverResponse::Credential {
            service: service_name,
            login: login_name,
            password,
            description,
        })
    }

    async fn encrypt_password(&self, plaintext: &str) -> DriverResult<Vec<u8>> {
        let (_c, payload) = self
            .dispatcher
            .send(Command::EncryptPassword, plaintext.as_bytes().to_vec())
            .await?;
        if payload.first().copied().unwrap_or(1) != 0 {
            return Err(DriverError::DeviceRejected { command: Command::EncryptPassword.code() });
        }
        let ciphertext = payload.get(1..).unwrap_or_default().to_vec();
        if ciphertext.len() != self.sizes.pwd_enc_len {
            return Err(DriverError::protocol(format!(
                "EncryptPassword returned {} bytes, expected {}",
                ciphertext.len(),
                self.sizes.pwd_enc_len
            )));
        }
        Ok(ciphertext)
    }

    async fn decrypt_password(&self, ciphertext: &[u8]) -> DriverResult<String> {
        let (_c, payload) = self
            .dispatcher
            .send(Command::DecryptPassword, ciphertext.to_vec())
            .await?;
        let Some(&status) = payload.first() else {
            return Err(DriverError::protocol("DecryptPassword reply missing status byte"));
        };
        if status != 0 {
            return Err(DriverError::CryptoFailure);
        }
        let Some(&len) = payload.get(1) else {
            return Err(DriverError::protocol("DecryptPassword reply missing length byte"));
        };
        let bytes = payload
            .get(2..2 + len as usize)
            .ok_or_else(|| DriverError::protocol("DecryptPassword reply truncated"))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DriverError::CryptoFailure)
    }

    #[allow(clippy::too_many_arguments)]
    async fn set_credential(
        &mut self,
        reqid: RequestId,
        service: &str,
        login: &str,
        password: &str,
        description: Option<&str>,
        set_description: bool,
        progress: &mut impl FnMut(ProgressUpdate),
    ) -> DriverResult<DriverResponse> {
        let password_enc = self.encrypt_password(password).await?;
        let today = encode_date_today();

        self.with_ephemeral_session(&reqid, progress, |session| {
            let parent_id = match session.clone.graph.find_by_service(session.clone.cred_start, service) {
                Some(id) => id,
                None => {
                    let id = session.clone.graph.insert_virtual(NodeBody::CredParent(ParentNode {
                        service_name: service.to_string(),
                        prev: None,
                        next: None,
                        first_child: None,
                    }));
                    session.clone.cred_start = Some(session.clone.graph.insert_parent_sorted(session.clone.cred_start, id));
                    id
                }
            };

            match session.clone.graph.find_child_by_login_under(parent_id, login) {
                Some(child_id) => {
                    let Some(NodeBody::CredChild(child)) = session.clone.graph.get_mut(child_id) else {
                        return Err(DriverError::protocol("resolved node is not a credential child"));
                    };
                    child.password_enc = password_enc;
                    child.date_used = today;
                    if set_description {
                        child.description = description.unwrap_or_default().to_string();
                    }
                }
                None => {
                    let child_id = session.clone.graph.insert_virtual(NodeBody::CredChild(CredChildNode {
                        login: login.to_string(),
                        password_enc,
                        description: description.unwrap_or_default().to_string(),
                        prev: None,
                        next: None,
                        date_created: today,
                        date_used: today,
                    }));
                    codec::attach_child(&mut session.clone, parent_id, child_id);
                }
            }
            Ok(())
        })
        .await?;

        Ok(DriverResponse::Ack)
    }

    async fn get_data_node(
        &mut self,
        reqid: RequestId,
        service: &str,
        fallback_service: Option<&str>,
        progress: &mut impl FnMut(ProgressUpdate),
    ) -> DriverResult<DriverResponse> {
        let _ = progress;
        let bytes = self
            .with_read_only_session(&reqid, |session| {
                let parent_id = Self::find_parent(session, session.clone.data_start, service, fallback_service)?;
                let Some(NodeBody::DataParent(parent)) = session.clone.graph.get(parent_id) else {
                    return Err(DriverError::protocol("resolved node is not a data parent"));
                };
                let mut blocks = Vec::new();
                for child_id in session.clone.graph.chain_iter(parent.first_child) {
                    let Some(NodeBody::DataChild(child)) = session.clone.graph.get(child_id) else {
                        continue;
                    };
                    blocks.push(child.payload.clone());
                }
                Ok(reassemble_data_blocks(blocks))
            })
            .await?;

        Ok(DriverResponse::DataNode { service: service.to_string(), data: bytes })
    }

    async fn set_data_node(
        &mut self,
        reqid: RequestId,
        service: &str,
        data: &[u8],
        progress: &mut impl FnMut(ProgressUpdate),
    ) -> DriverResult<DriverResponse> {
        let blocks = split_data_into_blocks(data, self.sizes.data_payload_len);

        self.with_ephemeral_session(&reqid, progress, |session| {
            let parent_id = match session.clone.graph.find_by_service(session.clone.data_start, service) {
                Some(id) => {
                    let first_child = match session.clone.graph.get(id) {
                        Some(NodeBody::DataParent(p)) => p.first_child,
                        _ => None,
                    };
                    let old_children: Vec<NodeId> = session.clone.graph.chain_iter(first_child).collect();
                    for child_id in old_children {
                        if let Some(NodeAddr::Real(addr)) = session.clone.graph.address_of(child_id) {
                            session.clone.favorites.clear_references_to(addr);
                        }
                        session.clone.graph.remove(child_id);
                    }
                    if let Some(body) = session.clone.graph.get_mut(id) {
                        body.set_first_child(None);
                    }
                    id
                }
                None => {
                    let id = session.clone.graph.insert_virtual(NodeBody::DataParent(ParentNode {
                        service_name: service.to_string(),
                        prev: None,
                        next: None,
                        first_child: None,
                    }));
                    session.clone.data_start = Some(session.clone.graph.insert_parent_sorted(session.clone.data_start, id));
                    id
                }
            };

            let mut prev_id: Option<NodeId> = None;
            let mut first_child: Option<NodeId> = None;
            for (seq, block) in blocks.iter().enumerate() {
                let id = session.clone.graph.insert_virtual(NodeBody::DataChild(DataChildNode {
                    seq: seq as u16,
                    next: None,
                    payload: block.clone(),
                }));
                if first_child.is_none() {
                    first_child = Some(id);
                }
                if let Some(prev) = prev_id {
                    if let Some(body) = session.clone.graph.get_mut(prev) {
                        body.set_next(Some(id));
                    }
                }
                prev_id = Some(id);
            }
            if let Some(body) = session.clone.graph.get_mut(parent_id) {
                body.set_first_child(first_child);
            }
            Ok(())
        })
        .await?;

        Ok(DriverResponse::Ack)
    }

    async fn delete_from_chain(
        &mut self,
        reqid: RequestId,
        services: &[String],
        credential_side: bool,
        progress: &mut impl FnMut(ProgressUpdate),
    ) -> DriverResult<DriverResponse> {
        let services: Vec<String> = services.to_vec();
        self.with_ephemeral_session(&reqid, progress, |session| {
            for service in &services {
                let chain_head = if credential_side { session.clone.cred_start } else { session.clone.data_start };
                let Some(parent_id) = session.clone.graph.find_by_service(chain_head, service) else {
                    continue;
                };
                let first_child = session.clone.graph.get(parent_id).and_then(NodeBody::first_child);
                let children: Vec<NodeId> = session.clone.graph.chain_iter(first_child).collect();
                for child_id in children {
                    if let Some(NodeAddr::Real(addr)) = session.clone.graph.address_of(child_id) {
                        session.clone.favorites.clear_references_to(addr);
                    }
                    session.clone.graph.remove(child_id);
                }
                let new_head = session.clone.graph.unlink_parent(chain_head, parent_id);
                if credential_side {
                    session.clone.cred_start = new_head;
                } else {
                    session.clone.data_start = new_head;
                }
                session.clone.graph.remove(parent_id);
            }
            Ok(())
        })
        .await?;

        Ok(DriverResponse::Ack)
    }

    async fn export(&mut self, reqid: RequestId, encryption_name: &str, progress: &mut impl FnMut(ProgressUpdate)) -> DriverResult<DriverResponse> {
        let session = self.mmm.enter().await?;
        self.cancel_flags.insert(reqid.clone(), session.cancel_handle());
        let committed = self.finish_session(session, true, progress).await;
        self.cancel_flags.remove(&reqid);
        let authoritative = committed?;

        let payload = codec::build_export_payload(&authoritative, &self.sizes, self.bundle_version);
        let file_bytes = codec::encode_export_file(&payload, encryption_name)?;
        Ok(DriverResponse::FileBytes { data: file_bytes })
    }

    async fn import(&mut self, reqid: RequestId, file_bytes: &[u8], no_delete: bool, progress: &mut impl FnMut(ProgressUpdate)) -> DriverResult<DriverResponse> {
        // Encryption (if any) is handled by the caller before the bytes
        // reach this crate — see DESIGN.md: `export` takes an encryption
        // name but `import` doesn't, mirroring the client surface in §6.
        let payload = codec::decode_export_file(file_bytes, "none")?;
        let imported = codec::payload_to_graph(&payload, &self.sizes, &self.limits)?;

        self.with_ephemeral_session(&reqid, progress, |session| {
            codec::merge_import(&mut session.clone, &imported, no_delete);
            Ok(())
        })
        .await?;

        Ok(DriverResponse::Ack)
    }
}

fn reassemble_data_blocks(blocks: Vec<Vec<u8>>) -> Vec<u8> {
    let mut all = Vec::new();
    for block in blocks {
        all.extend_from_slice(&block);
    }
    if all.len() < DATA_LENGTH_PREFIX {
        return Vec::new();
    }
    let len = u32::from_le_bytes(all[0..DATA_LENGTH_PREFIX].try_into().unwrap()) as usize;
    let body = &all[DATA_LENGTH_PREFIX..];
    body[..len.min(body.len())].to_vec()
}

fn split_data_into_blocks(data: &[u8], block_size: usize) -> Vec<Vec<u8>> {
    let mut framed = Vec::with_capacity(DATA_LENGTH_PREFIX + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_le_bytes());
    framed.extend_from_slice(data);

    if framed.is_empty() {
        return vec![vec![0u8; block_size]];
    }
    let mut blocks = Vec::with_capacity(framed.len().div_ceil(block_size));
    for chunk in framed.chunks(block_size) {
        let mut block = vec![0u8; block_size];
        block[..chunk.len()].copy_from_slice(chunk);
        blocks.push(block);
    }
    blocks
}

fn encode_date_today() -> u16 {
    let (year, month, day) = civil_from_unix_days(days_since_epoch());
    let year_since_base = (year - DATE_BASE_YEAR).clamp(0, i64::from(u16::MAX >> 9)) as u16;
    encode_date(year_since_base, month as u8, day as u8)
}

fn days_since_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64 / 86_400)
        .unwrap_or(0)
}

/// Howard Hinnant's `civil_from_days`: days-since-1970-01-01 to
/// `(year, month, day)`, proleptic Gregorian. No dependency already in this
/// crate's stack covers this one device-specific compact date field, so
/// this is a small self-contained conversion rather than a new dependency
/// for one call site.
fn civil_from_unix_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if m <= 2 { y + 1 } else { y };
    (year, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_from_unix_days_matches_known_date() {
        // 2024-01-01 is 19723 days after the epoch.
        assert_eq!(civil_from_unix_days(19_723), (2024, 1, 1));
    }

    #[test]
    fn data_blocks_round_trip_through_split_and_reassemble() {
        let data = b"arbitrary blob spanning more than one block".to_vec();
        let blocks = split_data_into_blocks(&data, 16);
        assert!(blocks.iter().all(|b| b.len() == 16));
        assert_eq!(reassemble_data_blocks(blocks), data);
    }

    #[test]
    fn empty_data_round_trips() {
        let blocks = split_data_into_blocks(&[], 16);
        assert_eq!(reassemble_data_blocks(blocks), Vec::<u8>::new());
    }
}
