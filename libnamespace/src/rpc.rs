//! Request and response messages of the namespace master and their
//! dispatch. The gateway decodes its wire format into a [`Request`],
//! substituting option defaults, and maps the error kind back to a fault.

use log::debug;
use serde::{Deserialize, Serialize};

use common::{
    BlockId, CheckConsistencyOptions, CompleteFileOptions, CreateDirectoryOptions,
    CreateFileOptions, DeleteOptions, FileBlockInfo, FileInfo, FreeOptions, GetStatusOptions,
    InodeId, ListStatusOptions, LoadMetadataOptions, MountOptions, SetAttributeOptions,
    UnmountOptions,
};

use crate::consistency::ConsistencyReport;
use crate::error::Result;
use crate::master::NamespaceMaster;
use crate::mount::MountEntry;
use crate::path::NsPath;
use crate::persist::PersistFailure;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Request {
    CreateFile {
        path: String,
        options: CreateFileOptions,
    },
    CreateDirectory {
        path: String,
        options: CreateDirectoryOptions,
    },
    Delete {
        path: String,
        options: DeleteOptions,
    },
    Rename {
        src: String,
        dst: String,
    },
    SetAttribute {
        path: String,
        options: SetAttributeOptions,
    },
    GetStatus {
        path: String,
        options: GetStatusOptions,
    },
    GetStatusById {
        id: InodeId,
    },
    ListStatus {
        path: String,
        options: ListStatusOptions,
    },
    Free {
        path: String,
        options: FreeOptions,
    },
    CompleteFile {
        path: String,
        options: CompleteFileOptions,
    },
    GetNewBlockIdForFile {
        path: String,
    },
    GetFileBlockInfoList {
        path: String,
    },
    ScheduleAsyncPersist {
        path: String,
    },
    CheckConsistency {
        path: String,
        options: CheckConsistencyOptions,
    },
    Mount {
        path: String,
        ufs_uri: String,
        options: MountOptions,
    },
    Unmount {
        path: String,
        options: UnmountOptions,
    },
    GetMountTable,
    GetUfsAddress,
    /// Legacy form: loads ancestors and direct children.
    LoadMetadata {
        path: String,
        recursive: bool,
    },
    GetPersistFailures,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::CreateFile { .. } => "createFile",
            Request::CreateDirectory { .. } => "createDirectory",
            Request::Delete { .. } => "delete",
            Request::Rename { .. } => "rename",
            Request::SetAttribute { .. } => "setAttribute",
            Request::GetStatus { .. } => "getStatus",
            Request::GetStatusById { .. } => "getStatusById",
            Request::ListStatus { .. } => "listStatus",
            Request::Free { .. } => "free",
            Request::CompleteFile { .. } => "completeFile",
            Request::GetNewBlockIdForFile { .. } => "getNewBlockIdForFile",
            Request::GetFileBlockInfoList { .. } => "getFileBlockInfoList",
            Request::ScheduleAsyncPersist { .. } => "scheduleAsyncPersistence",
            Request::CheckConsistency { .. } => "checkConsistency",
            Request::Mount { .. } => "mount",
            Request::Unmount { .. } => "unmount",
            Request::GetMountTable => "getMountTable",
            Request::GetUfsAddress => "getUfsAddress",
            Request::LoadMetadata { .. } => "loadMetadata",
            Request::GetPersistFailures => "getPersistFailures",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Response {
    Done,
    FileId(InodeId),
    Status(FileInfo),
    Listing(Vec<FileInfo>),
    BlockId(BlockId),
    BlockInfos(Vec<FileBlockInfo>),
    Consistency(ConsistencyReport),
    MountTable(Vec<MountEntry>),
    UfsAddress(String),
    PersistFailures(Vec<PersistFailure>),
}

pub async fn handle(master: &NamespaceMaster, request: Request) -> Result<Response> {
    let name = request.name();
    debug!("Enter {name}");
    let result = dispatch(master, request).await;
    match &result {
        Ok(_) => debug!("Exit {name}"),
        Err(e) => debug!("Exit {name} with {:?}: {e}", e.kind()),
    }
    result
}

async fn dispatch(master: &NamespaceMaster, request: Request) -> Result<Response> {
    let response = match request {
        Request::CreateFile { path, options } => {
            Response::FileId(master.create_file(&path.parse()?, &options).await?)
        }
        Request::CreateDirectory { path, options } => {
            Response::FileId(master.create_directory(&path.parse()?, &options).await?)
        }
        Request::Delete { path, options } => {
            master.delete(&path.parse()?, &options).await?;
            Response::Done
        }
        Request::Rename { src, dst } => {
            let src: NsPath = src.parse()?;
            master.rename(&src, &dst.parse()?).await?;
            Response::Done
        }
        Request::SetAttribute { path, options } => {
            master.set_attribute(&path.parse()?, &options).await?;
            Response::Done
        }
        Request::GetStatus { path, options } => {
            Response::Status(master.get_status(&path.parse()?, &options).await?)
        }
        Request::GetStatusById { id } => Response::Status(master.get_status_by_id(id).await?),
        Request::ListStatus { path, options } => {
            Response::Listing(master.list_status(&path.parse()?, &options).await?)
        }
        Request::Free { path, options } => {
            master.free(&path.parse()?, &options).await?;
            Response::Done
        }
        Request::CompleteFile { path, options } => {
            master.complete_file(&path.parse()?, &options).await?;
            Response::Done
        }
        Request::GetNewBlockIdForFile { path } => {
            Response::BlockId(master.get_new_block_id_for_file(&path.parse()?).await?)
        }
        Request::GetFileBlockInfoList { path } => {
            Response::BlockInfos(master.get_file_block_info_list(&path.parse()?).await?)
        }
        Request::ScheduleAsyncPersist { path } => {
            master.schedule_async_persist(&path.parse()?).await?;
            Response::Done
        }
        Request::CheckConsistency { path, options } => {
            Response::Consistency(master.check_consistency(&path.parse()?, &options).await?)
        }
        Request::Mount {
            path,
            ufs_uri,
            options,
        } => {
            master.mount(&path.parse()?, &ufs_uri, options).await?;
            Response::Done
        }
        Request::Unmount { path, options } => {
            master.unmount(&path.parse()?, &options).await?;
            Response::Done
        }
        Request::GetMountTable => Response::MountTable(master.get_mount_table().await),
        Request::GetUfsAddress => Response::UfsAddress(master.get_ufs_address().await?),
        Request::LoadMetadata { path, recursive } => {
            let options = LoadMetadataOptions {
                create_ancestors: true,
                load_direct_children: true,
                recursive,
            };
            Response::FileId(master.load_metadata(&path.parse()?, &options).await?)
        }
        Request::GetPersistFailures => Response::PersistFailures(master.persist_failures()),
    };
    Ok(response)
}
