use crate::quiz::ExamSlot;

/// Subjects offered by the menus, plus the display names of the fixed mock
/// exam slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectCatalog {
    obligatory: Vec<String>,
    profile: Vec<String>,
    history: String,
    math_literacy: String,
    reading_literacy: String,
}

impl Default for SubjectCatalog {
    fn default() -> Self {
        Self::new(
            ["Математическая грамотность", "История Казахстана", "Грамотность чтения"],
            [
                "Математика",
                "Физика",
                "География",
                "Информатика",
                "Биология",
                "Химия",
                "Иностранный язык",
                "Основы права",
                "Творческий экзамен",
            ],
        )
        .with_slot_names("История Казахстана", "Математическая грамотность", "Грамотность чтения")
    }
}

impl SubjectCatalog {
    pub fn new<O, P>(obligatory: O, profile: P) -> Self
    where
        O: IntoIterator,
        O::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            obligatory: obligatory.into_iter().map(Into::into).collect(),
            profile: profile.into_iter().map(Into::into).collect(),
            history: "History".into(),
            math_literacy: "Math literacy".into(),
            reading_literacy: "Reading literacy".into(),
        }
    }

    #[must_use]
    pub fn with_slot_names(
        mut self,
        history: impl Into<String>,
        math_literacy: impl Into<String>,
        reading_literacy: impl Into<String>,
    ) -> Self {
        self.history = history.into();
        self.math_literacy = math_literacy.into();
        self.reading_literacy = reading_literacy.into();
        self
    }

    pub fn obligatory(&self) -> &[String] {
        &self.obligatory
    }

    pub fn profile(&self) -> &[String] {
        &self.profile
    }

    /// Profile subjects still available once `first` is picked.
    pub fn profile_except(&self, first: &str) -> Vec<String> {
        self.profile.iter().filter(|s| *s != first).cloned().collect()
    }

    pub fn is_obligatory(&self, name: &str) -> bool {
        self.obligatory.iter().any(|s| s == name)
    }

    pub fn is_profile(&self, name: &str) -> bool {
        self.profile.iter().any(|s| s == name)
    }

    /// Display name of a fixed slot; profile slots take the chosen subjects.
    pub fn slot_name<'a>(&'a self, slot: ExamSlot, profile1: &'a str, profile2: &'a str) -> &'a str {
        match slot {
            ExamSlot::History => &self.history,
            ExamSlot::MathLiteracy => &self.math_literacy,
            ExamSlot::ReadingLiteracy => &self.reading_literacy,
            ExamSlot::Profile1 => profile1,
            ExamSlot::Profile2 => profile2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_matches_ent_subjects() {
        let catalog = SubjectCatalog::default();
        assert_eq!(catalog.obligatory().len(), 3);
        assert_eq!(catalog.profile().len(), 9);
        assert!(catalog.is_obligatory("История Казахстана"));
        assert!(catalog.is_profile("Химия"));
        assert!(!catalog.is_profile("История Казахстана"));
        assert_eq!(
            catalog.slot_name(ExamSlot::History, "Физика", "Химия"),
            "История Казахстана"
        );
        assert_eq!(catalog.slot_name(ExamSlot::Profile2, "Физика", "Химия"), "Химия");
    }

    #[test]
    fn second_profile_list_excludes_first_pick() {
        let catalog = SubjectCatalog::new(["History"], ["Physics", "Chemistry", "Biology"]);
        assert_eq!(catalog.profile_except("Chemistry"), vec!["Physics", "Biology"]);
    }
}
