use recado_db::{Instance, Template};

/// Who is looking at or editing tenant data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerScope {
    Admin,
    School(String),
}

impl ViewerScope {
    /// `"admin"` is the administrator; anything else names a school.
    pub fn parse(viewer: &str) -> Self {
        match viewer.trim() {
            "admin" => Self::Admin,
            school => Self::School(school.to_string()),
        }
    }

    pub fn school_id(&self) -> Option<&str> {
        match self {
            Self::Admin => None,
            Self::School(id) => Some(id),
        }
    }

    pub fn can_view(&self, instance: &Instance) -> bool {
        match self {
            Self::Admin => true,
            Self::School(id) => instance.school_id == *id,
        }
    }

    /// Global templates are admin-only; school templates belong to their school.
    pub fn can_manage(&self, template: &Template) -> bool {
        match (self, template.school_id.as_deref()) {
            (Self::Admin, _) => true,
            (Self::School(id), Some(owner)) => id == owner,
            (Self::School(_), None) => false,
        }
    }
}
