//! RBAC store on custom resources

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};

use pylon_common::core::{Reference, Role, RoleBinding, RoleBindingList, RoleList};

use super::objects::{self, RoleBindingSpec, RoleSpec};
use super::{map_kube_error, ok_or_kube_error, CrdStore};
use crate::rbac::populate_taints;
use crate::{Backend, RbacStore, Result};

#[async_trait]
impl RbacStore for CrdStore {
    async fn create_role(&self, role: &Role) -> Result<()> {
        let api: Api<objects::Role> = self.api();
        let obj = objects::Role {
            metadata: ObjectMeta {
                name: Some(role.id.clone()),
                ..Default::default()
            },
            spec: RoleSpec { role: role.clone() },
        };
        ok_or_kube_error(api.create(&PostParams::default(), &obj).await)?;
        Ok(())
    }

    async fn delete_role(&self, reference: &Reference) -> Result<()> {
        let api: Api<objects::Role> = self.api();
        ok_or_kube_error(api.delete(&reference.id, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn get_role(&self, reference: &Reference) -> Result<Role> {
        let api: Api<objects::Role> = self.api();
        let obj = api.get(&reference.id).await.map_err(map_kube_error)?;
        Ok(obj.spec.role)
    }

    async fn list_roles(&self) -> Result<RoleList> {
        let api: Api<objects::Role> = self.api();
        let list = ok_or_kube_error(api.list(&Default::default()).await)?;
        Ok(RoleList {
            items: list.items.into_iter().map(|obj| obj.spec.role).collect(),
        })
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<()> {
        let api: Api<objects::RoleBinding> = self.api();
        let mut stored = binding.clone();
        stored.taints.clear();
        let obj = objects::RoleBinding {
            metadata: ObjectMeta {
                name: Some(binding.id.clone()),
                ..Default::default()
            },
            spec: RoleBindingSpec { binding: stored },
        };
        ok_or_kube_error(api.create(&PostParams::default(), &obj).await)?;
        Ok(())
    }

    async fn delete_role_binding(&self, reference: &Reference) -> Result<()> {
        let api: Api<objects::RoleBinding> = self.api();
        ok_or_kube_error(api.delete(&reference.id, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn get_role_binding(&self, reference: &Reference) -> Result<RoleBinding> {
        let api: Api<objects::RoleBinding> = self.api();
        let obj = api.get(&reference.id).await.map_err(map_kube_error)?;
        let mut binding = obj.spec.binding;
        populate_taints(self as &dyn Backend, &mut binding).await?;
        Ok(binding)
    }

    async fn list_role_bindings(&self) -> Result<RoleBindingList> {
        let api: Api<objects::RoleBinding> = self.api();
        let list = ok_or_kube_error(api.list(&Default::default()).await)?;
        let mut items = Vec::with_capacity(list.items.len());
        for obj in list.items {
            let mut binding = obj.spec.binding;
            populate_taints(self as &dyn Backend, &mut binding).await?;
            items.push(binding);
        }
        Ok(RoleBindingList { items })
    }
}
