use serde::{Deserialize, Serialize};

use crate::Configuration;

/// Which surface initiated the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChosenBy {
    #[default]
    None,
    Ui,
    Terminal,
}

impl ChosenBy {
    pub fn as_str(self) -> &'static str {
        match self {
            ChosenBy::None => "none",
            ChosenBy::Ui => "ui",
            ChosenBy::Terminal => "terminal",
        }
    }

    pub fn is_chosen(self) -> bool {
        !matches!(self, ChosenBy::None)
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SelectionState {
    #[serde(rename = "chosenBy")]
    pub chosen_by: ChosenBy,
    pub frozen: Option<Configuration>,
}
