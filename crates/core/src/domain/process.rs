use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub i64);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Draft,
    Active,
    Pending,
    Rejected,
    Expired,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "pending" => Some(Self::Pending),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A reusable approval chain template.
///
/// Processes are never hard-deleted: `archived_at` marks a retired process so
/// entities that went through it keep a resolvable history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    pub title: String,
    pub status: ProcessStatus,
    pub is_active: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Process {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Whether new entities may be submitted against this process.
    pub fn accepts_submissions(&self) -> bool {
        self.is_active && !self.is_archived()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProcess {
    pub title: String,
    pub status: ProcessStatus,
    pub is_active: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessChanges {
    pub title: Option<String>,
    pub status: Option<ProcessStatus>,
    pub is_active: Option<bool>,
}

impl ProcessChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.status.is_none() && self.is_active.is_none()
    }

    pub fn apply_to(&self, process: &mut Process) {
        if let Some(title) = &self.title {
            process.title = title.trim().to_string();
        }
        if let Some(status) = self.status {
            process.status = status;
        }
        if let Some(is_active) = self.is_active {
            process.is_active = is_active;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPageRequest {
    pub after: Option<ProcessId>,
    pub limit: u32,
    pub include_archived: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPage {
    pub items: Vec<Process>,
    pub next_after: Option<ProcessId>,
}

impl ProcessPage {
    /// Builds a page from rows fetched with `limit + 1`; the surplus row only
    /// signals that another page exists.
    pub fn from_overfetch(mut items: Vec<Process>, limit: u32) -> Self {
        let limit = limit as usize;
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_after = if has_more { items.last().map(|process| process.id) } else { None };
        Self { items, next_after }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{Process, ProcessChanges, ProcessId, ProcessPage, ProcessStatus};

    fn process(id: i64) -> Process {
        let now = Utc::now();
        Process {
            id: ProcessId(id),
            title: format!("Process {id}"),
            status: ProcessStatus::Active,
            is_active: true,
            archived_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_parse_accepts_stored_spelling() {
        for status in [
            ProcessStatus::Draft,
            ProcessStatus::Active,
            ProcessStatus::Pending,
            ProcessStatus::Rejected,
            ProcessStatus::Expired,
        ] {
            assert_eq!(ProcessStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ProcessStatus::parse(" ACTIVE "), Some(ProcessStatus::Active));
        assert_eq!(ProcessStatus::parse("retired"), None);
    }

    #[test]
    fn archived_or_inactive_process_rejects_submissions() {
        let mut inactive = process(1);
        inactive.is_active = false;
        assert!(!inactive.accepts_submissions());

        let mut archived = process(2);
        archived.archived_at = Some(Utc::now());
        assert!(!archived.accepts_submissions());

        assert!(process(3).accepts_submissions());
    }

    #[test]
    fn changes_only_touch_provided_fields() {
        let mut target = process(4);
        ProcessChanges { title: Some("  Capex approval ".to_string()), ..Default::default() }
            .apply_to(&mut target);

        assert_eq!(target.title, "Capex approval");
        assert_eq!(target.status, ProcessStatus::Active);
        assert!(target.is_active);
    }

    #[test]
    fn overfetched_page_reports_cursor_only_when_more_rows_exist() {
        let page = ProcessPage::from_overfetch(vec![process(1), process(2), process(3)], 2);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_after, Some(ProcessId(2)));

        let last = ProcessPage::from_overfetch(vec![process(3)], 2);
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.next_after, None);
    }
}
