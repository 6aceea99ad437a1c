use std::collections::{BTreeSet, HashMap, HashSet};

use crate::domain::workflow::ApproverSelector;

/// Organization lookups the engine needs. Implementations are expected to be
/// fast local or cached lookups.
pub trait DirectoryLookup: Send + Sync {
    fn members_of_department(&self, department_id: &str) -> Result<Vec<String>, String>;
    fn users_with_role(&self, role: &str) -> Result<Vec<String>, String>;
    fn department_of(&self, user_id: &str) -> Result<Option<String>, String>;
    fn is_administrator(&self, user_id: &str) -> Result<bool, String>;
}

/// Resolves selectors to a de-duplicated, ordered set of user ids.
pub fn resolve_selectors<D>(
    directory: &D,
    selectors: &[ApproverSelector],
) -> Result<BTreeSet<String>, String>
where
    D: DirectoryLookup + ?Sized,
{
    let mut resolved = BTreeSet::new();
    for selector in selectors {
        let users = match selector {
            ApproverSelector::ExplicitUsers { user_ids } => user_ids.clone(),
            ApproverSelector::Department { department_id } => {
                directory.members_of_department(department_id)?
            }
            ApproverSelector::Role { role } => directory.users_with_role(role)?,
        };
        resolved.extend(
            users.into_iter().map(|user| user.trim().to_string()).filter(|user| !user.is_empty()),
        );
    }
    Ok(resolved)
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    departments_by_user: HashMap<String, String>,
    roles_by_user: HashMap<String, HashSet<String>>,
    administrators: HashSet<String>,
}

impl InMemoryDirectory {
    pub fn with_member(mut self, user_id: &str, department_id: &str) -> Self {
        self.departments_by_user.insert(user_id.to_string(), normalize_key(department_id));
        self
    }

    pub fn with_role(mut self, user_id: &str, role: &str) -> Self {
        self.roles_by_user.entry(user_id.to_string()).or_default().insert(normalize_key(role));
        self
    }

    pub fn with_administrator(mut self, user_id: &str) -> Self {
        self.administrators.insert(user_id.to_string());
        self
    }
}

impl DirectoryLookup for InMemoryDirectory {
    fn members_of_department(&self, department_id: &str) -> Result<Vec<String>, String> {
        let department_id = normalize_key(department_id);
        let mut members: Vec<String> = self
            .departments_by_user
            .iter()
            .filter(|(_, department)| **department == department_id)
            .map(|(user, _)| user.clone())
            .collect();
        members.sort();
        Ok(members)
    }

    fn users_with_role(&self, role: &str) -> Result<Vec<String>, String> {
        let role = normalize_key(role);
        let mut users: Vec<String> = self
            .roles_by_user
            .iter()
            .filter(|(_, roles)| roles.contains(&role))
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        Ok(users)
    }

    fn department_of(&self, user_id: &str) -> Result<Option<String>, String> {
        Ok(self.departments_by_user.get(user_id).cloned())
    }

    fn is_administrator(&self, user_id: &str) -> Result<bool, String> {
        Ok(self.administrators.contains(user_id))
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::{resolve_selectors, DirectoryLookup, InMemoryDirectory};
    use crate::domain::workflow::ApproverSelector;

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::default()
            .with_member("u-ana", "finance")
            .with_member("u-ben", "Finance")
            .with_member("u-cho", "quality")
            .with_role("u-cho", "qa_lead")
            .with_role("u-ben", "QA_LEAD")
            .with_administrator("u-root")
    }

    #[test]
    fn selectors_union_without_duplicates() {
        let resolved = resolve_selectors(
            &directory(),
            &[
                ApproverSelector::Department { department_id: "finance".to_string() },
                ApproverSelector::Role { role: "qa_lead".to_string() },
                ApproverSelector::ExplicitUsers {
                    user_ids: vec!["u-ana".to_string(), " ".to_string()],
                },
            ],
        )
        .expect("resolve selectors");

        assert_eq!(resolved.into_iter().collect::<Vec<_>>(), vec!["u-ana", "u-ben", "u-cho"]);
    }

    #[test]
    fn department_and_admin_lookups() {
        let directory = directory();
        assert_eq!(directory.department_of("u-cho"), Ok(Some("quality".to_string())));
        assert_eq!(directory.department_of("u-nobody"), Ok(None));
        assert_eq!(directory.is_administrator("u-root"), Ok(true));
        assert_eq!(directory.is_administrator("u-ana"), Ok(false));
    }
}
