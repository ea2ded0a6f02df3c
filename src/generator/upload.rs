//! Upload job that streams an export into object storage.
//!
//! An init container downloads the compressed disk from the export server
//! into a scratch volume; the main container copies it to the bucket. The
//! job is owned by the export, and its secret is owned by the job, so
//! deleting the export after the upload cleans up everything.

use std::collections::BTreeMap;

use shell_escape::unix::escape;

use crate::resources::batch::{Job, JobSpec};
use crate::resources::core::{
    Container, EnvFromSource, EnvVar, PodSpec, PodTemplateSpec, Secret, Volume, VolumeMount,
};
use crate::resources::kubevirt::VirtualMachineExport;
use crate::resources::{LocalObjectReference, ObjectMeta, OwnerReference};

/// Header carrying the export token on download requests.
pub const EXPORT_TOKEN_HEADER: &str = "x-kubevirt-export-token";

const SCRATCH_VOLUME: &str = "temp";
const SCRATCH_PATH: &str = "/tmp";
const TOKEN_ENV: &str = "EXPORT_TOKEN";
const CA_CERT_ENV: &str = "EXPORT_CA_CERT";
const CA_CERT_FILE: &str = "/tmp/export-ca.pem";
const DOWNLOAD_IMAGE: &str = "curlimages/curl:8.6.0";
const UPLOAD_IMAGE: &str = "amazon/aws-cli:latest";

/// Inputs for the upload job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploaderOptions {
    /// Image name; the object is stored as `<name>.img.gz`.
    pub name: String,
    /// Namespace of the export.
    pub namespace: String,
    /// Internal download URL of the compressed source volume.
    pub export_url: String,
    /// Export download token.
    pub export_token: String,
    /// PEM certificate of the export server, when published.
    pub export_cert: Option<String>,
    /// Destination bucket.
    pub bucket: String,
    /// Key prefix inside the bucket.
    pub key_prefix: String,
    /// Access key for the destination.
    pub access_key_id: String,
    /// Secret key for the destination.
    pub secret_access_key: String,
    /// Destination region.
    pub region: String,
}

impl UploaderOptions {
    fn file_name(&self) -> String {
        format!("{}.img.gz", self.name)
    }

    fn secret_name(&self) -> String {
        format!("{}-s3-uploader", self.name)
    }

    fn job_name(&self) -> String {
        format!("s3-uploader-{}", self.name)
    }

    /// `s3://bucket/prefix/<name>.img.gz` with empty segments dropped.
    #[must_use]
    pub fn destination(&self) -> String {
        let file_name = self.file_name();
        let key = [self.bucket.as_str(), self.key_prefix.as_str(), file_name.as_str()]
            .iter()
            .map(|segment| segment.trim_matches('/'))
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        format!("s3://{key}")
    }

    fn download_script(&self) -> String {
        let target = format!("{SCRATCH_PATH}/{}", self.file_name());
        let url = escape(self.export_url.as_str().into());
        let mut script = String::from("set -e; ");
        let mut tls = String::new();
        if self.export_cert.is_some() {
            script.push_str(&format!("printf '%s' \"${CA_CERT_ENV}\" > {CA_CERT_FILE}; "));
            tls = format!("--cacert {CA_CERT_FILE} ");
        }
        script.push_str(&format!(
            "curl --fail --silent --show-error {tls}-H \"{EXPORT_TOKEN_HEADER}: ${TOKEN_ENV}\" -o {target} {url}"
        ));
        script
    }

    fn upload_script(&self) -> String {
        let source = format!("{SCRATCH_PATH}/{}", self.file_name());
        let destination = self.destination();
        format!(
            "aws s3 cp {source} {}",
            escape(destination.as_str().into())
        )
    }
}

/// Download-then-upload job owned by `export`.
#[must_use]
pub fn uploader_job(export: &VirtualMachineExport, opts: &UploaderOptions) -> Job {
    let secret = opts.secret_name();
    let scratch = vec![VolumeMount::new(SCRATCH_VOLUME, SCRATCH_PATH)];

    let mut download_env = vec![EnvVar::from_secret(TOKEN_ENV, &secret, TOKEN_ENV)];
    if opts.export_cert.is_some() {
        download_env.push(EnvVar::from_secret(CA_CERT_ENV, &secret, CA_CERT_ENV));
    }

    Job {
        metadata: ObjectMeta::namespaced(&opts.namespace, &opts.job_name())
            .owned_by(OwnerReference::controller_of(export)),
        spec: JobSpec {
            ttl_seconds_after_finished: None,
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                spec: PodSpec {
                    init_containers: vec![Container {
                        name: String::from("download"),
                        image: DOWNLOAD_IMAGE.to_owned(),
                        command: vec![
                            String::from("/bin/sh"),
                            String::from("-c"),
                            opts.download_script(),
                        ],
                        env: download_env,
                        volume_mounts: scratch.clone(),
                        ..Container::default()
                    }],
                    containers: vec![Container {
                        name: String::from("upload"),
                        image: UPLOAD_IMAGE.to_owned(),
                        command: vec![
                            String::from("/bin/sh"),
                            String::from("-c"),
                            opts.upload_script(),
                        ],
                        env_from: vec![EnvFromSource {
                            secret_ref: Some(LocalObjectReference::new(secret)),
                        }],
                        volume_mounts: scratch,
                        ..Container::default()
                    }],
                    volumes: vec![Volume::empty_dir(SCRATCH_VOLUME)],
                    restart_policy: Some(String::from("Never")),
                    ..PodSpec::default()
                },
            },
        },
        status: None,
    }
}

/// Credentials and token consumed by the upload job, owned by `job`.
#[must_use]
pub fn uploader_secret(job: &Job, opts: &UploaderOptions) -> Secret {
    let mut string_data = BTreeMap::from([
        (
            String::from("AWS_ACCESS_KEY_ID"),
            opts.access_key_id.clone(),
        ),
        (
            String::from("AWS_SECRET_ACCESS_KEY"),
            opts.secret_access_key.clone(),
        ),
        (String::from("AWS_REGION"), opts.region.clone()),
        (TOKEN_ENV.to_owned(), opts.export_token.clone()),
    ]);
    if let Some(cert) = &opts.export_cert {
        string_data.insert(CA_CERT_ENV.to_owned(), cert.clone());
    }

    Secret {
        metadata: ObjectMeta::namespaced(&opts.namespace, &opts.secret_name())
            .owned_by(OwnerReference::controller_of(job)),
        type_: Some(String::from("Opaque")),
        string_data,
    }
}
