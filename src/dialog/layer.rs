use super::{Dialog, DialogId};
use crate::headers::TargetDialog;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Process-wide dialog registry, keyed by [`DialogId`].
#[derive(Default)]
pub struct DialogLayer {
    dialogs: Mutex<HashMap<DialogId, Dialog>>,
}

impl DialogLayer {
    pub(crate) fn insert(&self, dialog: Dialog) -> Result<()> {
        let id = dialog.id().clone();
        let mut dialogs = self.dialogs.lock();

        if dialogs.contains_key(&id) {
            return Err(Error::Dialog(id, "dialog id already registered".into()));
        }

        dialogs.insert(id, dialog);
        Ok(())
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.lock().get(id).cloned()
    }

    pub(crate) fn remove(&self, id: &DialogId) {
        self.dialogs.lock().remove(id);
    }

    /// Resolve an RFC 4538 `Target-Dialog` header. Its tags are written
    /// from the sender's point of view, so they are swapped for the
    /// lookup; the unswapped orientation is tried as a fallback.
    pub fn find_target_dialog(&self, td: &TargetDialog) -> Option<Dialog> {
        let swapped = DialogId::new(
            td.call_id.clone(),
            td.remote_tag.clone(),
            td.local_tag.clone(),
        );

        self.get(&swapped).or_else(|| {
            self.get(&DialogId::new(
                td.call_id.clone(),
                td.local_tag.clone(),
                td.remote_tag.clone(),
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.dialogs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.lock().is_empty()
    }

    pub(crate) fn drain(&self) -> Vec<Dialog> {
        self.dialogs.lock().drain().map(|(_, d)| d).collect()
    }
}
