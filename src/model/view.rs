use serde::{Deserialize, Serialize};

/// Filter tab selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterTab {
    #[default]
    All,
    Active,
    Archived,
}

/// Sort key for the task list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    UpdatedAt,
    DueDate,
    Priority,
    Title,
}

/// Per-user view preferences: filter tab, search query, sort key.
///
/// Persisted through the record store so it survives reloads, and
/// broadcast across tabs so all tabs show the same view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    #[serde(default)]
    pub filter: FilterTab,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub sort: SortKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_defaults_on_empty_object() {
        let view: ViewState = serde_json::from_str("{}").unwrap();
        assert_eq!(view.filter, FilterTab::All);
        assert_eq!(view.search, "");
        assert_eq!(view.sort, SortKey::CreatedAt);
    }

    #[test]
    fn round_trip() {
        let view = ViewState {
            filter: FilterTab::Archived,
            search: "quarterly".into(),
            sort: SortKey::DueDate,
        };
        let json = serde_json::to_string(&view).unwrap();
        let back: ViewState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, view);
    }
}
