use crate::layout::InstanceLayout;
use crate::marker::MarkerFile;
use crate::StoreError;
use serde::{Deserialize, Serialize};

/// Instance context persisted after installation and consulted before
/// every engine launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceContext {
    pub storage_type: String,
    pub ins_logic_id: String,
}

/// Identity markers: the logical instance id and the instance context.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    logic_id: MarkerFile,
    context: MarkerFile,
}

impl IdentityStore {
    pub fn new(layout: &InstanceLayout) -> Self {
        Self {
            logic_id: MarkerFile::new(layout.logic_id()),
            context: MarkerFile::new(layout.instance_ctx()),
        }
    }

    pub fn read_logic_id(&self) -> Result<Option<String>, StoreError> {
        match self.logic_id.read()? {
            None => Ok(None),
            Some(id) if id.is_empty() => Err(StoreError::InvalidMarker {
                path: self.logic_id.path().display().to_string(),
                content: id,
            }),
            Some(id) => Ok(Some(id)),
        }
    }

    pub fn write_logic_id(&self, id: &str) -> Result<(), StoreError> {
        self.logic_id.set(id)
    }

    pub fn read_context(&self) -> Result<Option<InstanceContext>, StoreError> {
        match self.context.read()? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    pub fn write_context(&self, ctx: &InstanceContext) -> Result<(), StoreError> {
        let content = serde_json::to_string(ctx)?;
        self.context.set(&content)
    }
}
