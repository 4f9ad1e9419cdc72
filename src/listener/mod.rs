//! C-STORE SCP: accepts associations from upstream peers, reassembles
//! incoming instances, and writes them into the spool.
//!
//! Grounded directly on the teacher's `storescp/store_async.rs` association
//! loop — PDU dispatch, C-ECHO handling, C-STORE command/data reassembly,
//! file-meta rebuild via `FileMetaTableBuilder`. The napi event-emission
//! closures and the `STUDY_STORE` `lazy_static` are replaced with an `mpsc`
//! channel of `FileStored` events consumed by the watcher, per the
//! dependency-injection requirement this crate commits to.

pub mod sop_classes;

use std::path::PathBuf;
use std::sync::Arc;

use dicom_core::header::Tag;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::{pdu::PDataValueType, Pdu};
use snafu::{OptionExt, Report, ResultExt, Whatever};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::listener::sop_classes::{route_for, RouteClass, ABSTRACT_SYNTAXES};
use crate::spool::{Spool, SUBDIR_DCM, SUBDIR_STRUCTURE};

/// Emitted once a received instance has been written into the spool.
#[derive(Debug, Clone)]
pub struct FileStored {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub file_path: PathBuf,
    pub route: RouteClass,
}

pub struct Listener {
    cfg: ListenerConfig,
    spool: Spool,
    events: mpsc::Sender<FileStored>,
    association_permits: Arc<Semaphore>,
}

impl Listener {
    pub fn new(cfg: ListenerConfig, spool: Spool, events: mpsc::Sender<FileStored>, max_associations: usize) -> Self {
        Listener {
            cfg,
            spool,
            events,
            association_permits: Arc::new(Semaphore::new(max_associations.max(1))),
        }
    }

    /// Runs the accept loop until `shutdown` fires.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), Whatever> {
        let listener = TcpListener::bind((self.cfg.host, self.cfg.port))
            .await
            .whatever_context("failed to bind DICOM listener socket")?;
        info!(host = %self.cfg.host, port = self.cfg.port, "listener bound");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let permit = match self.association_permits.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(%peer, "rejecting association, at max concurrent associations");
                            continue;
                        }
                    };
                    let cfg = self.cfg.clone();
                    let spool = self.spool.clone();
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_association(stream, &cfg, &spool, &events).await {
                            warn!(%peer, error = %Report::from_error(e), "association ended with an error");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_association(
    scu_stream: TcpStream,
    cfg: &ListenerConfig,
    spool: &Spool,
    events: &mpsc::Sender<FileStored>,
) -> Result<(), Whatever> {
    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut msgid: u16 = 1;
    let mut sop_class_uid = String::new();
    let mut sop_instance_uid = String::new();

    let mut options = dicom_ul::association::ServerAssociationOptions::new()
        .ae_title(&cfg.ae_title)
        .strict(false)
        .max_pdu_length(16384)
        .promiscuous(false);

    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }
    for uid in ABSTRACT_SYNTAXES {
        options = options.with_abstract_syntax(*uid);
    }

    let mut association = options
        .establish_async(scu_stream)
        .await
        .whatever_context("could not establish association")?;

    info!(peer_ae = %association.client_ae_title(), "association established");

    let inactivity_timeout = Duration::from_secs(cfg.association_timeout_seconds);

    loop {
        let received = match tokio::time::timeout(inactivity_timeout, association.receive()).await {
            Ok(received) => received,
            Err(_) => {
                warn!(
                    peer_ae = %association.client_ae_title(),
                    timeout_seconds = cfg.association_timeout_seconds,
                    "association inactivity timeout elapsed, closing"
                );
                break;
            }
        };
        match received {
            Ok(pdu) => match pdu {
                Pdu::PData { data } => {
                    for data_value in data {
                        if data_value.value_type == PDataValueType::Data && !data_value.is_last {
                            instance_buffer.extend_from_slice(&data_value.data);
                        } else if data_value.value_type == PDataValueType::Command && data_value.is_last {
                            let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
                            let obj = InMemDicomObject::read_dataset_with_ts(data_value.data.as_slice(), &ts)
                                .whatever_context("failed to read incoming DICOM command")?;
                            let command_field = obj
                                .element(tags::COMMAND_FIELD)
                                .whatever_context("missing Command Field")?
                                .uint16()
                                .whatever_context("Command Field is not an integer")?;

                            if command_field == 0x0030 {
                                let response = create_cecho_response(msgid);
                                send_command(&mut association, &response, data_value.presentation_context_id).await?;
                            } else {
                                msgid = obj
                                    .element(tags::MESSAGE_ID)
                                    .whatever_context("missing Message ID")?
                                    .to_int()
                                    .whatever_context("Message ID is not an integer")?;
                                sop_class_uid = read_str(&obj, tags::AFFECTED_SOP_CLASS_UID)
                                    .whatever_context("missing Affected SOP Class UID")?;
                                sop_instance_uid = read_str(&obj, tags::AFFECTED_SOP_INSTANCE_UID)
                                    .whatever_context("missing Affected SOP Instance UID")?;
                            }
                            instance_buffer.clear();
                        } else if data_value.value_type == PDataValueType::Data && data_value.is_last {
                            instance_buffer.extend_from_slice(&data_value.data);

                            if instance_buffer.len() as u64 > cfg.max_instance_bytes {
                                warn!(len = instance_buffer.len(), "instance exceeds configured size cap, aborting association");
                                return Ok(());
                            }

                            let pc = association
                                .presentation_contexts()
                                .iter()
                                .find(|pc| pc.id == data_value.presentation_context_id)
                                .whatever_context("missing presentation context")?;
                            let ts = TransferSyntaxRegistry
                                .get(&pc.transfer_syntax)
                                .whatever_context("negotiated transfer syntax not registered")?;

                            let obj = InMemDicomObject::read_dataset_with_ts(instance_buffer.as_slice(), ts)
                                .whatever_context("failed to read DICOM data object")?;

                            let stored = store_instance(spool, &obj, ts.uid())
                                .await
                                .whatever_context("failed to store instance")?;

                            let _ = events.send(stored).await;

                            let response = create_cstore_response(msgid, &sop_class_uid, &sop_instance_uid);
                            send_command(&mut association, &response, data_value.presentation_context_id).await?;
                            instance_buffer.clear();
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    let _ = association.send(&Pdu::ReleaseRP).await;
                    info!(peer_ae = %association.client_ae_title(), "association released");
                    break;
                }
                Pdu::AbortRQ { source } => {
                    warn!(?source, "association aborted by peer");
                    break;
                }
                _ => {}
            },
            Err(err) => {
                debug!(error = %Report::from_error(err), "association ended");
                break;
            }
        }
    }

    Ok(())
}

fn read_str(obj: &InMemDicomObject<StandardDataDictionary>, tag: Tag) -> Option<String> {
    obj.element(tag).ok().and_then(|e| e.to_str().ok()).map(|s| s.to_string())
}

async fn store_instance(
    spool: &Spool,
    obj: &InMemDicomObject<StandardDataDictionary>,
    transfer_syntax_uid: &str,
) -> Result<FileStored, Whatever> {
    let sop_class_uid = read_str(obj, tags::SOP_CLASS_UID).whatever_context("missing SOP Class UID")?;
    let sop_instance_uid = read_str(obj, tags::SOP_INSTANCE_UID).whatever_context("missing SOP Instance UID")?;
    let study_instance_uid = read_str(obj, tags::STUDY_INSTANCE_UID).whatever_context("missing Study Instance UID")?;
    let series_instance_uid = read_str(obj, tags::SERIES_INSTANCE_UID).whatever_context("missing Series Instance UID")?;

    let file_meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid.as_str())
        .media_storage_sop_instance_uid(sop_instance_uid.as_str())
        .transfer_syntax(transfer_syntax_uid)
        .build()
        .whatever_context("failed to build DICOM file meta information")?;

    let route = route_for(&sop_class_uid);
    let subdir = match route {
        RouteClass::Structure => SUBDIR_STRUCTURE,
        RouteClass::Image | RouteClass::Other => SUBDIR_DCM,
    };

    spool
        .create(&study_instance_uid)
        .map_err(|e| Whatever::without_source(format!("could not create study directory: {e}")))?;
    let series_dir = spool
        .subdir_path(&study_instance_uid, subdir)
        .map_err(|e| Whatever::without_source(e.to_string()))?
        .join(&series_instance_uid);
    std::fs::create_dir_all(&series_dir)
        .map_err(|e| Whatever::without_source(format!("could not create series directory: {e}")))?;

    let file_path = series_dir.join(format!("{}.dcm", sop_instance_uid.trim_end_matches('\0')));
    let file_obj = obj.clone().with_exact_meta(file_meta);

    let tmp_path = series_dir.join(format!(".tmp-{}.dcm", sop_instance_uid.trim_end_matches('\0')));
    file_obj
        .write_to_file(&tmp_path)
        .whatever_context("failed to serialise DICOM object")?;
    std::fs::rename(&tmp_path, &file_path)
        .map_err(|e| Whatever::without_source(format!("could not rename {}: {e}", tmp_path.display())))?;

    info!(path = %file_path.display(), "stored instance");

    Ok(FileStored {
        study_instance_uid,
        series_instance_uid,
        sop_instance_uid,
        sop_class_uid,
        file_path,
        route,
    })
}

async fn send_command(
    association: &mut dicom_ul::association::server::ServerAssociation<TcpStream>,
    obj: &InMemDicomObject<StandardDataDictionary>,
    presentation_context_id: u8,
) -> Result<(), Whatever> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::new();
    obj.write_dataset_with_ts(&mut data, &ts)
        .whatever_context("could not write command dataset")?;
    let pdu = Pdu::PData {
        data: vec![dicom_ul::pdu::PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    };
    association.send(&pdu).await.whatever_context("failed to send command PDU")
}

fn create_cstore_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_instance_uid)),
    ])
}

fn create_cecho_response(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [0x0101])),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
    ])
}
