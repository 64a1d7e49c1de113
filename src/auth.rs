use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    SchoolAdmin,
    SuperAdmin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "student" => Some(Self::Student),
            "teacher" => Some(Self::Teacher),
            "schooladmin" => Some(Self::SchoolAdmin),
            "superadmin" => Some(Self::SuperAdmin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::SchoolAdmin => "schooladmin",
            Self::SuperAdmin => "superadmin",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ManageScope<'a> {
    Course(&'a str),
    SubjectGroup(&'a str),
}

pub fn role_of(conn: &Connection, user_id: &str) -> anyhow::Result<Option<Role>> {
    let raw: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(raw.as_deref().and_then(Role::parse))
}

/// Admins manage everything; teachers manage subject groups they teach
/// (and, for course scope, any course they teach a group of); students
/// manage nothing.
pub fn can_manage(conn: &Connection, user_id: &str, scope: ManageScope<'_>) -> anyhow::Result<bool> {
    let role = match role_of(conn, user_id)? {
        Some(r) => r,
        None => return Ok(false),
    };
    match role {
        Role::SuperAdmin | Role::SchoolAdmin => Ok(true),
        Role::Student => Ok(false),
        Role::Teacher => {
            let sql = match scope {
                ManageScope::Course(_) => {
                    "SELECT 1 FROM subject_groups WHERE course_id = ? AND teacher_id = ? LIMIT 1"
                }
                ManageScope::SubjectGroup(_) => {
                    "SELECT 1 FROM subject_groups WHERE id = ? AND teacher_id = ? LIMIT 1"
                }
            };
            let target = match scope {
                ManageScope::Course(id) => id,
                ManageScope::SubjectGroup(id) => id,
            };
            let hit: Option<i64> = conn
                .query_row(sql, [target, user_id], |r| r.get(0))
                .optional()?;
            Ok(hit.is_some())
        }
    }
}
