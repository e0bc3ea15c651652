use crate::audit::AuditSink;
use crate::error::KernelError;
use crate::storage::KernelStore;
use crate::types::*;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Organization/Group CRUD with per-organization group-DAG edge insertion and
/// membership management. Edge insertion walks ancestors of the proposed
/// parent looking for the proposed child before committing, so the graph can never
/// observe a cycle even transiently.
pub struct OrgGroupService {
    store: Arc<KernelStore>,
    audit: Arc<AuditSink>,
}

impl OrgGroupService {
    pub fn new(store: Arc<KernelStore>, audit: Arc<AuditSink>) -> Self {
        Self { store, audit }
    }

    pub async fn create_organization(&self, owner: &str, name: &str) -> Result<Organization, KernelError> {
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner: owner.to_string(),
            created_at: Utc::now(),
        };
        self.store.organizations.write().await.insert(org.id, org.clone());

        // The owner auto-becomes an admin member of a synthetic root group.
        let root = Group {
            id: Uuid::new_v4(),
            org: org.id,
            name: "root".to_string(),
            created_at: Utc::now(),
        };
        self.store.groups.write().await.insert(root.id, root.clone());
        self.store.group_memberships.write().await.push(GroupMembership {
            org: org.id,
            group: root.id,
            principal: owner.to_string(),
            role: MembershipRole::Admin,
        });

        self.audit
            .record(AuditEvent::new("org.created", org.id.to_string()).actor(owner))
            .await;
        Ok(org)
    }

    pub async fn create_group(&self, caller: &str, org: OrgId, name: &str) -> Result<Group, KernelError> {
        self.require_admin(caller, org).await?;
        let group = Group {
            id: Uuid::new_v4(),
            org,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.store.groups.write().await.insert(group.id, group.clone());
        self.audit
            .record(AuditEvent::new("group.created", group.id.to_string()).actor(caller))
            .await;
        Ok(group)
    }

    pub async fn add_member(
        &self,
        caller: &str,
        org: OrgId,
        group: GroupId,
        principal: &str,
        role: MembershipRole,
    ) -> Result<(), KernelError> {
        self.require_admin(caller, org).await?;
        let mut memberships = self.store.group_memberships.write().await;
        memberships.retain(|m| !(m.group == group && m.principal == principal));
        memberships.push(GroupMembership {
            org,
            group,
            principal: principal.to_string(),
            role,
        });
        drop(memberships);
        self.audit
            .record(
                AuditEvent::new("group.member_added", group.to_string())
                    .actor(caller)
                    .detail(serde_json::json!({ "principal": principal, "role": format!("{:?}", role) })),
            )
            .await;
        Ok(())
    }

    pub async fn remove_member(&self, caller: &str, org: OrgId, group: GroupId, principal: &str) -> Result<(), KernelError> {
        self.require_admin(caller, org).await?;
        self.store
            .group_memberships
            .write()
            .await
            .retain(|m| !(m.group == group && m.principal == principal));
        self.audit
            .record(AuditEvent::new("group.member_removed", group.to_string()).actor(caller))
            .await;
        Ok(())
    }

    /// Adds a `parent -> child` edge, rejecting it with `Conflict` if it would
    /// create a cycle (a recursive reachability search from the proposed parent
    /// back to the proposed child would succeed).
    pub async fn add_edge(&self, caller: &str, org: OrgId, parent: GroupId, child: GroupId) -> Result<(), KernelError> {
        self.require_admin(caller, org).await?;

        if parent == child {
            return Err(KernelError::conflict("self-referential group edge"));
        }

        if self.reachable(org, child, parent).await {
            return Err(KernelError::conflict("edge would create a cycle in the group graph"));
        }

        self.store.group_edges.write().await.push(GroupEdge { org, parent, child });
        self.audit
            .record(
                AuditEvent::new("group.edge_added", format!("{parent}->{child}"))
                    .actor(caller)
                    .detail(serde_json::json!({ "org": org })),
            )
            .await;
        Ok(())
    }

    pub async fn remove_edge(&self, caller: &str, org: OrgId, parent: GroupId, child: GroupId) -> Result<(), KernelError> {
        self.require_admin(caller, org).await?;
        self.store
            .group_edges
            .write()
            .await
            .retain(|e| !(e.org == org && e.parent == parent && e.child == child));
        self.audit
            .record(AuditEvent::new("group.edge_removed", format!("{parent}->{child}")).actor(caller))
            .await;
        Ok(())
    }

    /// Is `to` reachable from `from` by following `parent -> child` edges, bounded
    /// by a depth guard against accidental infinite walks.
    async fn reachable(&self, org: OrgId, from: GroupId, to: GroupId) -> bool {
        let edges = self.store.group_edges.read().await;
        let mut visited = std::collections::HashSet::new();
        let mut frontier = vec![(from, 0usize)];

        while let Some((current, depth)) = frontier.pop() {
            if depth > 4096 || !visited.insert(current) {
                continue;
            }
            if current == to {
                return true;
            }
            for edge in edges.iter().filter(|e| e.org == org && e.parent == current) {
                frontier.push((edge.child, depth + 1));
            }
        }
        false
    }

    /// Replaces an agent's security label. Gated the same way every other
    /// structural mutation on an organization is: caller must hold `admin`
    /// membership somewhere in the org.
    pub async fn update_agent_label(
        &self,
        caller: &str,
        org: OrgId,
        agent_id: &str,
        label: SecurityLabel,
    ) -> Result<Agent, KernelError> {
        self.require_admin(caller, org).await?;
        let mut agents = self.store.agents.write().await;
        let agent = agents.get_mut(agent_id).ok_or(KernelError::NotFound)?;
        if agent.org != org {
            return Err(KernelError::NotFound);
        }
        agent.label = label;
        let updated = agent.clone();
        drop(agents);
        self.audit
            .record(AuditEvent::new("agent.label_updated", agent_id.to_string()).actor(caller))
            .await;
        Ok(updated)
    }

    async fn require_admin(&self, caller: &str, org: OrgId) -> Result<(), KernelError> {
        let memberships = self.store.group_memberships.read().await;
        let groups = self.store.groups.read().await;
        let is_admin = memberships.iter().any(|m| {
            m.org == org
                && m.principal == caller
                && m.role == MembershipRole::Admin
                && groups.get(&m.group).map(|g| g.org == org).unwrap_or(false)
        });
        if is_admin {
            Ok(())
        } else {
            Err(KernelError::InsufficientTier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use std::path::PathBuf;

    async fn harness() -> OrgGroupService {
        let store = KernelStore::bootstrap(&StorageConfig::Memory).await.unwrap();
        let audit = Arc::new(
            AuditSink::bootstrap(store.clone(), 1024, 16, 50, PathBuf::from("/tmp/kernel-test-org.jsonl")).await,
        );
        OrgGroupService::new(store, audit)
    }

    #[tokio::test]
    async fn owner_can_create_groups_and_edges() {
        let service = harness().await;
        let org = service.create_organization("alice", "acme").await.unwrap();

        let x = service.create_group("alice", org.id, "X").await.unwrap();
        let y = service.create_group("alice", org.id, "Y").await.unwrap();
        let z = service.create_group("alice", org.id, "Z").await.unwrap();

        service.add_edge("alice", org.id, x.id, y.id).await.unwrap();
        service.add_edge("alice", org.id, y.id, z.id).await.unwrap();

        let result = service.add_edge("alice", org.id, z.id, x.id).await;
        assert!(matches!(result, Err(KernelError::Conflict(_))));

        let edges = service.store.group_edges.read().await;
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn non_admin_cannot_mutate_structure() {
        let service = harness().await;
        let org = service.create_organization("alice", "acme").await.unwrap();
        let result = service.create_group("mallory", org.id, "X").await;
        assert!(matches!(result, Err(KernelError::InsufficientTier)));
    }
}
