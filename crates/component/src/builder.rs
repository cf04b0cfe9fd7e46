//! Desired-state builders for the objects a component owns.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tessera_core::labels::{self, Labels};
use tessera_core::spec::SynthesizedComponent;
use tessera_core::Owner;

pub fn headless_service_name(comp: &SynthesizedComponent) -> String { format!("{}-headless", comp.workload_name()) }

pub fn env_config_map_name(comp: &SynthesizedComponent) -> String { format!("{}-env", comp.workload_name()) }

/// Client service name; the unnamed service takes the workload's name.
pub fn service_name(comp: &SynthesizedComponent, svc: &str) -> String {
    if svc.is_empty() { comp.workload_name() } else { format!("{}-{}", comp.workload_name(), svc) }
}

/// Produces the desired objects of a component.
pub trait ObjectBuilder: Send + Sync {
    fn workload(&self, comp: &SynthesizedComponent, owner: &Owner) -> StatefulSet;
    /// Headless service first, then one client service per declared service.
    fn services(&self, comp: &SynthesizedComponent, owner: &Owner) -> Vec<Service>;
    /// `None` when the component should not carry a budget.
    fn disruption_budget(&self, comp: &SynthesizedComponent, owner: &Owner) -> Option<PodDisruptionBudget>;
    fn env_config_map(&self, comp: &SynthesizedComponent, owner: &Owner, env: BTreeMap<String, String>) -> ConfigMap;
}

#[derive(Debug, Clone)]
pub struct DefaultBuilder {
    manager: String,
}

impl DefaultBuilder {
    pub fn new(manager: impl Into<String>) -> Self { Self { manager: manager.into() } }

    fn labels(&self, comp: &SynthesizedComponent) -> Labels {
        let mut l = comp.match_labels();
        l.insert(labels::MANAGED_BY.to_string(), self.manager.clone());
        if !comp.component_def.is_empty() {
            l.insert(labels::COMPONENT_DEF.to_string(), comp.component_def.clone());
        }
        l
    }

    fn meta(&self, comp: &SynthesizedComponent, owner: &Owner, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(comp.namespace.clone()),
            labels: Some(self.labels(comp)),
            owner_references: Some(vec![owner.owner_reference()]),
            ..Default::default()
        }
    }

    fn all_ports(comp: &SynthesizedComponent) -> Vec<ServicePort> {
        let mut ports: Vec<ServicePort> = Vec::new();
        for p in comp.services.iter().flat_map(|s| s.ports.iter()) {
            if !ports.iter().any(|q| q.port == p.port) {
                ports.push(p.clone());
            }
        }
        ports
    }
}

impl ObjectBuilder for DefaultBuilder {
    fn workload(&self, comp: &SynthesizedComponent, owner: &Owner) -> StatefulSet {
        let mut template = comp.template.clone();
        let tmeta = template.metadata.get_or_insert_with(Default::default);
        tmeta.labels.get_or_insert_with(Default::default).extend(self.labels(comp));

        let claims = comp
            .volume_claim_templates
            .iter()
            .map(|t| PersistentVolumeClaim {
                metadata: ObjectMeta { name: Some(t.name.clone()), labels: Some(comp.match_labels()), ..Default::default() },
                spec: Some(t.spec.clone()),
                status: None,
            })
            .collect::<Vec<_>>();

        StatefulSet {
            metadata: self.meta(comp, owner, comp.workload_name()),
            spec: Some(StatefulSetSpec {
                replicas: Some(comp.replicas),
                selector: LabelSelector { match_labels: Some(comp.match_labels()), match_expressions: None },
                service_name: headless_service_name(comp),
                template,
                volume_claim_templates: if claims.is_empty() { None } else { Some(claims) },
                // Pods are recreated by the role-aware restart, never by the workload controller.
                update_strategy: Some(StatefulSetUpdateStrategy { type_: Some("OnDelete".into()), rolling_update: None }),
                pod_management_policy: Some("Parallel".into()),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn services(&self, comp: &SynthesizedComponent, owner: &Owner) -> Vec<Service> {
        let headless = Service {
            metadata: self.meta(comp, owner, headless_service_name(comp)),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".into()),
                selector: Some(comp.match_labels()),
                ports: Some(Self::all_ports(comp)),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            status: None,
        };
        let mut out = vec![headless];
        for svc in comp.services.iter() {
            let mut selector = comp.match_labels();
            if !comp.consensus.leader.name.is_empty() {
                selector.insert(labels::ROLE.to_string(), comp.consensus.leader.name.clone());
            }
            out.push(Service {
                metadata: self.meta(comp, owner, service_name(comp, &svc.name)),
                spec: Some(ServiceSpec {
                    selector: Some(selector),
                    ports: Some(svc.ports.clone()),
                    type_: svc.service_type.clone(),
                    ..Default::default()
                }),
                status: None,
            });
        }
        out
    }

    fn disruption_budget(&self, comp: &SynthesizedComponent, owner: &Owner) -> Option<PodDisruptionBudget> {
        if comp.replicas <= 1 {
            return None;
        }
        Some(PodDisruptionBudget {
            metadata: self.meta(comp, owner, comp.workload_name()),
            spec: Some(PodDisruptionBudgetSpec {
                min_available: Some(IntOrString::Int(1)),
                selector: Some(LabelSelector { match_labels: Some(comp.match_labels()), match_expressions: None }),
                ..Default::default()
            }),
            status: None,
        })
    }

    fn env_config_map(&self, comp: &SynthesizedComponent, owner: &Owner, env: BTreeMap<String, String>) -> ConfigMap {
        ConfigMap { metadata: self.meta(comp, owner, env_config_map_name(comp)), data: Some(env), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::spec::{AccessMode, ComponentService, ConsensusMember, ConsensusSpec, VolumeClaimTemplate};

    fn owner() -> Owner {
        Owner {
            api_version: "apps.tessera.io/v1alpha1".into(),
            kind: "Cluster".into(),
            namespace: "default".into(),
            name: "mycluster".into(),
            uid: "uid-1".into(),
        }
    }

    fn comp(replicas: i32) -> SynthesizedComponent {
        let mut consensus = ConsensusSpec::default();
        consensus.leader = ConsensusMember::new("leader", AccessMode::ReadWrite);
        SynthesizedComponent {
            cluster_name: "mycluster".into(),
            namespace: "default".into(),
            name: "mysql".into(),
            component_def: "mysql".into(),
            replicas,
            consensus,
            volume_claim_templates: vec![VolumeClaimTemplate { name: "data".into(), spec: Default::default() }],
            horizontal_scale_policy: None,
            template: Default::default(),
            services: vec![ComponentService {
                name: String::new(),
                ports: vec![ServicePort { port: 3306, ..Default::default() }],
                service_type: None,
            }],
        }
    }

    #[test]
    fn workload_is_owned_labelled_and_on_delete() {
        let b = DefaultBuilder::new("tessera");
        let sts = b.workload(&comp(3), &owner());
        assert_eq!(sts.metadata.name.as_deref(), Some("mycluster-mysql"));
        assert!(owner().owns(&sts.metadata));
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "mycluster-mysql-headless");
        assert_eq!(spec.update_strategy.and_then(|s| s.type_).as_deref(), Some("OnDelete"));
        let pod_labels = spec.template.metadata.and_then(|m| m.labels).unwrap();
        assert_eq!(pod_labels.get(labels::MANAGED_BY).map(String::as_str), Some("tessera"));
        assert_eq!(pod_labels.get(labels::COMPONENT_NAME).map(String::as_str), Some("mysql"));
        assert_eq!(spec.volume_claim_templates.map(|v| v.len()), Some(1));
    }

    #[test]
    fn client_service_targets_the_leader() {
        let svcs = DefaultBuilder::new("tessera").services(&comp(3), &owner());
        assert_eq!(svcs.len(), 2);
        assert_eq!(svcs[0].spec.as_ref().and_then(|s| s.cluster_ip.as_deref()), Some("None"));
        assert_eq!(svcs[1].metadata.name.as_deref(), Some("mycluster-mysql"));
        let sel = svcs[1].spec.as_ref().and_then(|s| s.selector.clone()).unwrap();
        assert_eq!(sel.get(labels::ROLE).map(String::as_str), Some("leader"));
    }

    #[test]
    fn budget_only_for_several_replicas() {
        let b = DefaultBuilder::new("tessera");
        assert!(b.disruption_budget(&comp(1), &owner()).is_none());
        let pdb = b.disruption_budget(&comp(3), &owner()).unwrap();
        assert_eq!(pdb.spec.and_then(|s| s.min_available), Some(IntOrString::Int(1)));
    }
}
