use serde::{Deserialize, Serialize};
use std::fmt;

/// Artifact sources, in the order every indexing job processes them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Photos,
    WhatsApp,
    Messages,
    Notes,
    Calendar,
    Contacts,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        ArtifactKind::Photos,
        ArtifactKind::WhatsApp,
        ArtifactKind::Messages,
        ArtifactKind::Notes,
        ArtifactKind::Calendar,
        ArtifactKind::Contacts,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ArtifactKind::Photos => "photos",
            ArtifactKind::WhatsApp => "whatsapp",
            ArtifactKind::Messages => "messages",
            ArtifactKind::Notes => "notes",
            ArtifactKind::Calendar => "calendar",
            ArtifactKind::Contacts => "contacts",
        }
    }

    /// Manifest domain holding the source database.
    pub fn source_domain(self) -> &'static str {
        match self {
            ArtifactKind::Photos => "CameraRollDomain",
            ArtifactKind::WhatsApp => "AppDomainGroup-group.net.whatsapp.WhatsApp.shared",
            ArtifactKind::Messages => "HomeDomain",
            ArtifactKind::Notes => "AppDomain-com.apple.mobilenotes",
            ArtifactKind::Calendar => "HomeDomain",
            ArtifactKind::Contacts => "HomeDomain",
        }
    }

    pub fn source_path(self) -> &'static str {
        match self {
            ArtifactKind::Photos => "Media/PhotoData/Photos.sqlite",
            ArtifactKind::WhatsApp => "ChatStorage.sqlite",
            ArtifactKind::Messages => "Library/SMS/sms.db",
            ArtifactKind::Notes => "Library/Notes/notes.sqlite",
            ArtifactKind::Calendar => "Library/Calendar/Calendar.sqlitedb",
            ArtifactKind::Contacts => "Library/AddressBook/AddressBook.sqlitedb",
        }
    }

    /// File name under the backup's decrypted directory.
    pub fn decrypted_name(self) -> &'static str {
        match self {
            ArtifactKind::Photos => "Photos.sqlite",
            ArtifactKind::WhatsApp => "ChatStorage.sqlite",
            ArtifactKind::Messages => "chat.db",
            ArtifactKind::Notes => "notes.sqlite",
            ArtifactKind::Calendar => "Calendar.sqlite",
            ArtifactKind::Contacts => "AddressBook.sqlitedb",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::file_id::resolve_file_id;

    #[test]
    fn order_and_names_are_stable() {
        let names: Vec<_> = ArtifactKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            ["photos", "whatsapp", "messages", "notes", "calendar", "contacts"]
        );
        let sms = ArtifactKind::Messages;
        assert_eq!(
            resolve_file_id(sms.source_domain(), sms.source_path()),
            "3d0d7e5fb2ce288813306e4d4636395e047a3d28"
        );
    }
}
