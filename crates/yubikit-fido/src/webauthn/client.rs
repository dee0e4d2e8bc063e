//! The WebAuthn client: composes `makeCredential` and `getAssertion`
//! over a CTAP2 session, with PIN/UV auth, the extension pipeline, and a
//! CTAP1 (U2F) fallback for keys that predate CTAP2.

use std::collections::BTreeMap;

use ciborium::value::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use yubikit_core::apdu::{ApduProcessor, SW_CONDITIONS_NOT_SATISFIED, SW_WRONG_DATA};
use yubikit_core::cbor::{self, MapBuilder};
use yubikit_core::{CommandState, Error, SmartCardConnection};

use crate::cose::{alg, CoseKey};
use crate::ctap1::{Ctap1Session, CTRL_CHECK_ONLY, CTRL_ENFORCE_UP_AND_SIGN};
use crate::ctap2::client_pin::{ClientPin, PinPermissions, PinToken};
use crate::ctap2::get_assertion::GetAssertionRequest;
use crate::ctap2::make_credential::MakeCredentialRequest;
use crate::ctap2::pin_uv::{self, PinUvAuthProtocol, PinUvAuthProtocolV1};
use crate::ctap2::{Ctap2Session, InfoData};
use crate::extensions::{default_extensions, AuthParams, Extension};
use crate::origin::{validate_origin, OriginFetcher};
use crate::webauthn::attestation::AttestationObject;
use crate::webauthn::authenticator_data::{
    AttestedCredentialData, AuthenticatorData, AuthenticatorDataFlags,
};
use crate::webauthn::client_data::{self, ClientDataProvider};
use crate::webauthn::credential::{
    AuthenticatorAssertionResponse, AuthenticatorAttestationResponse, PublicKeyCredential,
};
use crate::webauthn::{
    PublicKeyCredentialCreationOptions, PublicKeyCredentialDescriptor,
    PublicKeyCredentialRequestOptions, PublicKeyCredentialUserEntity, ResidentKeyRequirement,
    UserVerificationRequirement,
};
use crate::{CtapStatus, FidoError};

/// Which authentication factor failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthType {
    Pin,
    Uv,
}

/// One selectable assertion, surfaced for caller-driven selection.
#[derive(Clone, Debug)]
pub struct AssertionChoice {
    pub user: Option<PublicKeyCredentialUserEntity>,
    pub credential_id: Vec<u8>,
}

/// Raised when a discoverable-credential request matches several
/// credentials; the caller picks one and finalizes with
/// [`MultipleAssertionsAvailable::select`].
#[derive(Debug)]
pub struct MultipleAssertionsAvailable {
    entries: Vec<(
        Option<PublicKeyCredentialUserEntity>,
        PublicKeyCredential<AuthenticatorAssertionResponse>,
    )>,
}

impl MultipleAssertionsAvailable {
    /// The `{user, credentialId}` tuples to present for selection.
    pub fn choices(&self) -> Vec<AssertionChoice> {
        self.entries
            .iter()
            .map(|(user, credential)| AssertionChoice {
                user: user.clone(),
                credential_id: credential.raw_id.clone(),
            })
            .collect()
    }

    /// Finalize with the chosen entry.
    pub fn select(
        mut self,
        index: usize,
    ) -> Result<PublicKeyCredential<AuthenticatorAssertionResponse>, ClientError> {
        if index >= self.entries.len() {
            return Err(ClientError::BadRequest("assertion selection out of range"));
        }
        Ok(self.entries.swap_remove(index).1)
    }
}

/// Errors surfaced by the WebAuthn client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("configuration unsupported: {0}")]
    ConfigurationUnsupported(&'static str),

    #[error("device ineligible: {0}")]
    DeviceIneligible(&'static str),

    #[error("the operation timed out")]
    Timeout,

    /// The operation was cancelled cooperatively, or denied on-device.
    #[error("the operation was cancelled")]
    Cancelled,

    /// A PIN is configured and must be supplied.
    #[error("a PIN is required for this operation")]
    PinRequired,

    /// PIN or UV verification failed; `retries` is the count remaining as
    /// re-queried from the authenticator, `Some(0)` when blocked.
    #[error("{auth_type:?} verification failed ({retries:?} retries remaining)")]
    AuthInvalid {
        auth_type: AuthType,
        retries: Option<u8>,
    },

    /// Several discoverable credentials matched; pick one via
    /// [`MultipleAssertionsAvailable::select`].
    #[error("multiple assertions are available")]
    MultipleAssertions(MultipleAssertionsAvailable),

    #[error(transparent)]
    Fido(#[from] FidoError),

    #[error("{0}")]
    Other(&'static str),
}

impl From<Error> for ClientError {
    fn from(error: Error) -> Self {
        ClientError::Fido(FidoError::Core(error))
    }
}

enum Backend<C> {
    Ctap2(Ctap2Session<C>),
    Ctap1(Ctap1Session<C>),
}

/// A WebAuthn client bound to one connected key.
pub struct WebAuthnClient<C: SmartCardConnection> {
    backend: Backend<C>,
    protocol: Box<dyn PinUvAuthProtocol + Send + Sync>,
    extensions: Vec<Box<dyn Extension<C>>>,
    fetcher: Option<Box<dyn OriginFetcher>>,
}

impl<C: SmartCardConnection> WebAuthnClient<C> {
    /// Select the FIDO applet and probe for CTAP2; falls back to the U2F
    /// raw protocol when `getInfo` is not implemented.
    pub fn new(connection: C) -> Result<Self, ClientError> {
        let mut processor = ApduProcessor::new(connection);
        processor.select(&crate::ctap2::AID)?;
        if processor.supports_extended_length() {
            processor.force_extended();
        }
        let backend = match Ctap2Session::fetch_info(&mut processor) {
            Ok(info) => Backend::Ctap2(Ctap2Session::from_parts(processor, info)),
            Err(FidoError::Ctap2NotSupported) => {
                debug!("CTAP2 unavailable, using U2F fallback");
                Backend::Ctap1(Ctap1Session::from_processor(processor))
            }
            Err(err) => return Err(err.into()),
        };
        let protocol: Box<dyn PinUvAuthProtocol + Send + Sync> = match &backend {
            Backend::Ctap2(session) => pin_uv::preferred(&session.info().pin_uv_auth_protocols)
                .unwrap_or_else(|| Box::new(PinUvAuthProtocolV1)),
            Backend::Ctap1(_) => Box::new(PinUvAuthProtocolV1),
        };
        Ok(Self {
            backend,
            protocol,
            extensions: default_extensions(),
            fetcher: None,
        })
    }

    /// Install the fetcher used for related-origin validation.
    pub fn with_origin_fetcher(mut self, fetcher: Box<dyn OriginFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Register an additional extension. Registration order is processing
    /// order; on output-key collisions the later registration wins.
    pub fn register_extension(&mut self, extension: Box<dyn Extension<C>>) {
        self.extensions.push(extension);
    }

    /// The cached authenticator info; `None` on the U2F fallback path.
    pub fn info(&self) -> Option<&InfoData> {
        match &self.backend {
            Backend::Ctap2(session) => Some(session.info()),
            Backend::Ctap1(_) => None,
        }
    }

    /// Create a credential, per the WebAuthn `makeCredential` operation.
    pub async fn make_credential(
        &mut self,
        client_data: &ClientDataProvider,
        options: &PublicKeyCredentialCreationOptions,
        effective_domain: &str,
        pin: Option<&[u8]>,
        enterprise_attestation: Option<u64>,
        state: Option<&CommandState>,
    ) -> Result<PublicKeyCredential<AuthenticatorAttestationResponse>, ClientError> {
        let rp_id = options
            .rp
            .id
            .clone()
            .unwrap_or_else(|| effective_domain.to_string());
        self.validate_rp_id(&rp_id, effective_domain, &client_data.origin)
            .await?;
        let client_data_json =
            client_data.client_data(client_data::TYPE_CREATE, &options.challenge);
        let hash = client_data::client_data_hash(&client_data_json);
        match &mut self.backend {
            Backend::Ctap2(session) => ctap2_make_credential(
                session,
                &self.extensions,
                self.protocol.as_ref(),
                options,
                &rp_id,
                client_data_json,
                hash,
                pin,
                enterprise_attestation,
                state,
            ),
            Backend::Ctap1(session) => {
                ctap1_make_credential(session, options, &rp_id, client_data_json, hash, state)
            }
        }
    }

    /// Request an assertion, per the WebAuthn `getAssertion` operation.
    pub async fn get_assertion(
        &mut self,
        client_data: &ClientDataProvider,
        options: &PublicKeyCredentialRequestOptions,
        effective_domain: &str,
        pin: Option<&[u8]>,
        state: Option<&CommandState>,
    ) -> Result<PublicKeyCredential<AuthenticatorAssertionResponse>, ClientError> {
        let rp_id = options
            .rp_id
            .clone()
            .unwrap_or_else(|| effective_domain.to_string());
        self.validate_rp_id(&rp_id, effective_domain, &client_data.origin)
            .await?;
        let client_data_json = client_data.client_data(client_data::TYPE_GET, &options.challenge);
        let hash = client_data::client_data_hash(&client_data_json);
        match &mut self.backend {
            Backend::Ctap2(session) => ctap2_get_assertion(
                session,
                &self.extensions,
                self.protocol.as_ref(),
                options,
                &rp_id,
                client_data_json,
                hash,
                pin,
                state,
            ),
            Backend::Ctap1(session) => {
                ctap1_get_assertion(session, options, &rp_id, client_data_json, hash, state)
            }
        }
    }

    /// The RP ID must be the effective domain or a registrable suffix of
    /// it; otherwise the RP may still authorize the caller's origin via
    /// its related-origins document.
    async fn validate_rp_id(
        &self,
        rp_id: &str,
        effective_domain: &str,
        caller_origin: &str,
    ) -> Result<(), ClientError> {
        if rp_id.is_empty() || effective_domain.is_empty() {
            return Err(ClientError::BadRequest("empty RP ID or effective domain"));
        }
        if effective_domain == rp_id || effective_domain.ends_with(&format!(".{rp_id}")) {
            return Ok(());
        }
        let Some(fetcher) = &self.fetcher else {
            return Err(ClientError::BadRequest(
                "RP ID is not a registrable suffix of the effective domain",
            ));
        };
        validate_origin(caller_origin, rp_id, fetcher.as_ref())
            .await
            .map(drop)
            .map_err(|_| ClientError::BadRequest("caller origin not allowed for this RP ID"))
    }
}

/// Map a CTAP failure to the typed client error, re-querying retry
/// counters where the protocol calls for it.
fn map_ctap_error<C: SmartCardConnection>(
    session: &mut Ctap2Session<C>,
    protocol: &dyn PinUvAuthProtocol,
    error: FidoError,
) -> ClientError {
    let Some(status) = error.ctap_status() else {
        return ClientError::Fido(error);
    };
    match status {
        CtapStatus::PinInvalid | CtapStatus::PinAuthInvalid => {
            let retries = ClientPin::new(session, protocol)
                .get_pin_retries()
                .ok()
                .map(|(retries, _)| retries);
            ClientError::AuthInvalid {
                auth_type: AuthType::Pin,
                retries,
            }
        }
        CtapStatus::PinBlocked | CtapStatus::PinAuthBlocked => ClientError::AuthInvalid {
            auth_type: AuthType::Pin,
            retries: Some(0),
        },
        CtapStatus::UvInvalid => {
            let retries = ClientPin::new(session, protocol).get_uv_retries().ok();
            ClientError::AuthInvalid {
                auth_type: AuthType::Uv,
                retries,
            }
        }
        CtapStatus::UvBlocked => ClientError::AuthInvalid {
            auth_type: AuthType::Uv,
            retries: Some(0),
        },
        CtapStatus::PinRequired | CtapStatus::PinNotSet => ClientError::PinRequired,
        CtapStatus::OperationDenied | CtapStatus::KeepaliveCancel => ClientError::Cancelled,
        CtapStatus::UserActionTimeout | CtapStatus::ActionTimeout => ClientError::Timeout,
        CtapStatus::CredentialExcluded => ClientError::BadRequest("credentialExcluded"),
        CtapStatus::NoCredentials => ClientError::DeviceIneligible("no eligible credentials"),
        _ => ClientError::Fido(error),
    }
}

/// Decide whether a pinUvAuthToken is needed and acquire it: required
/// when a client PIN is set or the caller demands user verification.
fn acquire_token<C: SmartCardConnection>(
    session: &mut Ctap2Session<C>,
    protocol: &dyn PinUvAuthProtocol,
    info: &InfoData,
    pin: Option<&[u8]>,
    uv_required: bool,
    permissions: PinPermissions,
    rp_id: &str,
) -> Result<Option<PinToken>, ClientError> {
    let pin_set = info.pin_configured();
    if !pin_set && !uv_required {
        return Ok(None);
    }
    if pin.is_none() && info.uv_configured() && info.supports_permissions() {
        let result = ClientPin::new(session, protocol).get_uv_token(permissions, Some(rp_id));
        return match result {
            Ok(token) => Ok(Some(token)),
            Err(err) => Err(map_ctap_error(session, protocol, err)),
        };
    }
    let Some(pin) = pin else {
        return if pin_set {
            Err(ClientError::PinRequired)
        } else {
            Err(ClientError::ConfigurationUnsupported(
                "user verification required but not configured",
            ))
        };
    };
    let result = ClientPin::new(session, protocol).get_pin_token(pin, permissions, Some(rp_id));
    match result {
        Ok(token) => Ok(Some(token)),
        Err(err) => Err(map_ctap_error(session, protocol, err)),
    }
}

#[allow(clippy::too_many_arguments)]
fn ctap2_make_credential<C: SmartCardConnection>(
    session: &mut Ctap2Session<C>,
    extensions: &[Box<dyn Extension<C>>],
    protocol: &dyn PinUvAuthProtocol,
    options: &PublicKeyCredentialCreationOptions,
    rp_id: &str,
    client_data_json: Vec<u8>,
    hash: [u8; 32],
    pin: Option<&[u8]>,
    enterprise_attestation: Option<u64>,
    state: Option<&CommandState>,
) -> Result<PublicKeyCredential<AuthenticatorAttestationResponse>, ClientError> {
    let info = session.info().clone();

    // Algorithm intersection, caller preference first. A key that does
    // not report its algorithms is assumed to accept the request.
    if options.pub_key_cred_params.is_empty() {
        return Err(ClientError::BadRequest("pubKeyCredParams must not be empty"));
    }
    let supported = |alg: i64| {
        info.algorithms.is_empty() || info.algorithms.iter().any(|p| p.alg == alg)
    };
    if !options.pub_key_cred_params.iter().any(|p| supported(p.alg)) {
        return Err(ClientError::ConfigurationUnsupported(
            "no commonly supported credential algorithm",
        ));
    }

    // Resident-key and UV decisioning.
    let selection = options.authenticator_selection.clone().unwrap_or_default();
    let rk = match selection.resident_key {
        Some(ResidentKeyRequirement::Required) => {
            if !info.option_enabled("rk") {
                return Err(ClientError::ConfigurationUnsupported(
                    "discoverable credentials not supported",
                ));
            }
            true
        }
        Some(ResidentKeyRequirement::Preferred) => info.option_enabled("rk"),
        _ => false,
    };
    let uv_required = selection.user_verification == UserVerificationRequirement::Required;

    // Extension input pipeline.
    let mut permissions = PinPermissions::MAKE_CREDENTIAL;
    let mut auth_inputs = Vec::new();
    let mut finalizers = Vec::new();
    for extension in extensions {
        if let Some(outcome) =
            extension.process_create_input(session, &options.extensions, protocol)?
        {
            permissions |= outcome.permissions;
            if let Some(input) = outcome.auth_input {
                auth_inputs.push(input);
            }
            if let Some(finalize) = outcome.finalize {
                finalizers.push(finalize);
            }
        }
    }

    let token = acquire_token(session, protocol, &info, pin, uv_required, permissions, rp_id)?;
    let pin_uv_auth_param = token.as_ref().map(|t| protocol.authenticate(t, &hash));
    let pin_uv_auth_protocol = token.as_ref().map(|_| protocol.version());

    let mut options_map = MapBuilder::new();
    if rk {
        options_map.push(cbor::text("rk"), Value::Bool(true));
    }
    if uv_required && token.is_none() && info.option_enabled("uv") {
        // Deprecated FIDO 2.0 behaviour: on-device UV via the uv flag.
        options_map.push(cbor::text("uv"), Value::Bool(true));
    }
    let options_value = (!options_map.is_empty()).then(|| options_map.build());

    let extensions_value = (!auth_inputs.is_empty()).then(|| {
        let mut map = MapBuilder::new();
        for (name, value) in auth_inputs {
            map.push(cbor::text(name), value);
        }
        map.build()
    });

    // Exclude-list batching: when the list exceeds what one request may
    // carry, probe each chunk silently and send the real request bare.
    let mut exclude_list: &[PublicKeyCredentialDescriptor] = &options.exclude_credentials;
    let max_list = info.max_credential_count_in_list.unwrap_or(8).max(1) as usize;
    if exclude_list.len() > max_list {
        let mut probe_options = MapBuilder::new();
        probe_options.push(cbor::text("up"), Value::Bool(false));
        let probe_options = probe_options.build();
        for chunk in exclude_list.chunks(max_list) {
            let probe = GetAssertionRequest {
                rp_id,
                client_data_hash: &hash,
                allow_list: chunk,
                extensions: None,
                options: Some(probe_options.clone()),
                pin_uv_auth_param: None,
                pin_uv_auth_protocol: None,
            };
            match session.get_assertion(&probe, state) {
                Ok(_) => return Err(ClientError::BadRequest("credentialExcluded")),
                Err(FidoError::Ctap(
                    CtapStatus::NoCredentials | CtapStatus::InvalidCredential,
                )) => {}
                Err(err) => return Err(map_ctap_error(session, protocol, err)),
            }
        }
        exclude_list = &[];
    }

    let request = MakeCredentialRequest {
        client_data_hash: &hash,
        rp: &options.rp,
        rp_id,
        user: &options.user,
        pub_key_cred_params: &options.pub_key_cred_params,
        exclude_list,
        extensions: extensions_value,
        options: options_value,
        pin_uv_auth_param,
        pin_uv_auth_protocol,
        enterprise_attestation,
    };

    let attestation = match session.make_credential(&request, state) {
        Ok(attestation) => attestation,
        // A key may ask for fresh user presence once; obtain it and retry.
        Err(FidoError::Ctap(CtapStatus::UpRequired)) => {
            match session.make_credential(&request, state) {
                Ok(attestation) => attestation,
                Err(err) => return Err(map_ctap_error(session, protocol, err)),
            }
        }
        Err(err) => return Err(map_ctap_error(session, protocol, err)),
    };

    // Extension output pipeline; later registrations win on collisions.
    let auth_params = AuthParams {
        protocol,
        token: token.as_ref().map(|t| t.as_slice()),
    };
    let mut client_extension_results = BTreeMap::new();
    for finalize in &finalizers {
        if let Some((name, value)) = finalize(session, &attestation, &auth_params)? {
            client_extension_results.insert(name, value);
        }
    }

    let attested = attestation
        .auth_data
        .attested_credential_data
        .as_ref()
        .ok_or(ClientError::Fido(FidoError::Core(Error::BadResponse(
            "attestation without attested credential data",
        ))))?;
    let response = AuthenticatorAttestationResponse {
        client_data_json,
        transports: info.transports.clone(),
        attestation_object: attestation.to_bytes()?,
        authenticator_data: attestation.raw_auth_data.clone(),
        public_key: attested.public_key.to_der(),
        public_key_algorithm: attested.public_key.alg(),
    };
    Ok(PublicKeyCredential::new(
        attested.credential_id.clone(),
        response,
        client_extension_results,
    ))
}

#[allow(clippy::too_many_arguments)]
fn ctap2_get_assertion<C: SmartCardConnection>(
    session: &mut Ctap2Session<C>,
    extensions: &[Box<dyn Extension<C>>],
    protocol: &dyn PinUvAuthProtocol,
    options: &PublicKeyCredentialRequestOptions,
    rp_id: &str,
    client_data_json: Vec<u8>,
    hash: [u8; 32],
    pin: Option<&[u8]>,
    state: Option<&CommandState>,
) -> Result<PublicKeyCredential<AuthenticatorAssertionResponse>, ClientError> {
    let info = session.info().clone();
    let uv_required = options.user_verification == UserVerificationRequirement::Required;

    let mut permissions = PinPermissions::GET_ASSERTION;
    let mut auth_inputs = Vec::new();
    let mut finalizers = Vec::new();
    for extension in extensions {
        if let Some(outcome) =
            extension.process_get_input(session, &options.extensions, protocol)?
        {
            permissions |= outcome.permissions;
            if let Some(input) = outcome.auth_input {
                auth_inputs.push(input);
            }
            if let Some(finalize) = outcome.finalize {
                finalizers.push(finalize);
            }
        }
    }

    let token = acquire_token(session, protocol, &info, pin, uv_required, permissions, rp_id)?;
    let pin_uv_auth_param = token.as_ref().map(|t| protocol.authenticate(t, &hash));
    let pin_uv_auth_protocol = token.as_ref().map(|_| protocol.version());

    let mut options_map = MapBuilder::new();
    if uv_required && token.is_none() && info.option_enabled("uv") {
        options_map.push(cbor::text("uv"), Value::Bool(true));
    }
    let options_value = (!options_map.is_empty()).then(|| options_map.build());

    let extensions_value = (!auth_inputs.is_empty()).then(|| {
        let mut map = MapBuilder::new();
        for (name, value) in auth_inputs {
            map.push(cbor::text(name), value);
        }
        map.build()
    });

    let request = GetAssertionRequest {
        rp_id,
        client_data_hash: &hash,
        allow_list: &options.allow_credentials,
        extensions: extensions_value,
        options: options_value,
        pin_uv_auth_param,
        pin_uv_auth_protocol,
    };
    let assertions = match session.get_assertion(&request, state) {
        Ok(assertions) => assertions,
        Err(err) => return Err(map_ctap_error(session, protocol, err)),
    };

    let auth_params = AuthParams {
        protocol,
        token: token.as_ref().map(|t| t.as_slice()),
    };
    let mut entries = Vec::with_capacity(assertions.len());
    for assertion in &assertions {
        let mut client_extension_results = BTreeMap::new();
        for finalize in &finalizers {
            if let Some((name, value)) = finalize(session, assertion, &auth_params)? {
                client_extension_results.insert(name, value);
            }
        }
        let raw_id = assertion
            .credential_id()
            .map(<[u8]>::to_vec)
            .or_else(|| {
                (options.allow_credentials.len() == 1)
                    .then(|| options.allow_credentials[0].id.clone())
            })
            .ok_or(ClientError::Other("assertion without a credential id"))?;
        let response = AuthenticatorAssertionResponse {
            client_data_json: client_data_json.clone(),
            authenticator_data: assertion.raw_auth_data.clone(),
            signature: assertion.signature.clone(),
            user_handle: assertion.user.as_ref().map(|user| user.id.clone()),
        };
        entries.push((
            assertion.user.clone(),
            PublicKeyCredential::new(raw_id, response, client_extension_results),
        ));
    }
    if entries.len() == 1 {
        Ok(entries.pop().expect("one entry").1)
    } else {
        Err(ClientError::MultipleAssertions(MultipleAssertionsAvailable {
            entries,
        }))
    }
}

fn ctap1_make_credential<C: SmartCardConnection>(
    session: &mut Ctap1Session<C>,
    options: &PublicKeyCredentialCreationOptions,
    rp_id: &str,
    client_data_json: Vec<u8>,
    hash: [u8; 32],
    state: Option<&CommandState>,
) -> Result<PublicKeyCredential<AuthenticatorAttestationResponse>, ClientError> {
    if !options
        .pub_key_cred_params
        .iter()
        .any(|p| p.alg == alg::ES256)
    {
        return Err(ClientError::ConfigurationUnsupported(
            "U2F keys only support ES256",
        ));
    }
    let selection = options.authenticator_selection.clone().unwrap_or_default();
    if selection.resident_key == Some(ResidentKeyRequirement::Required) {
        return Err(ClientError::ConfigurationUnsupported(
            "discoverable credentials not supported",
        ));
    }
    if selection.user_verification == UserVerificationRequirement::Required {
        return Err(ClientError::ConfigurationUnsupported(
            "user verification not supported",
        ));
    }
    let app_param: [u8; 32] = Sha256::digest(rp_id.as_bytes()).into();

    // Check-only probes: a recognized handle means the credential is
    // already registered here.
    for credential in &options.exclude_credentials {
        match session.authenticate(&hash, &app_param, &credential.id, CTRL_CHECK_ONLY, state) {
            Ok(_) => return Err(ClientError::BadRequest("credentialExcluded")),
            Err(FidoError::Core(Error::Apdu {
                sw: SW_CONDITIONS_NOT_SATISFIED,
            })) => return Err(ClientError::BadRequest("credentialExcluded")),
            Err(FidoError::Core(Error::Apdu { sw: SW_WRONG_DATA })) => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let registration = match session.register(&hash, &app_param, state) {
        Ok(registration) => registration,
        Err(FidoError::Ctap(CtapStatus::OperationDenied)) => return Err(ClientError::Cancelled),
        Err(err) => return Err(err.into()),
    };
    let public_key = CoseKey::from_uncompressed_point(&registration.public_key_point)?;
    let auth_data = AuthenticatorData {
        rp_id_hash: app_param,
        flags: AuthenticatorDataFlags::USER_PRESENT
            | AuthenticatorDataFlags::ATTESTED_CREDENTIAL_DATA,
        sign_count: 0,
        attested_credential_data: Some(AttestedCredentialData {
            aaguid: [0; 16],
            credential_id: registration.key_handle.clone(),
            public_key: public_key.clone(),
        }),
        extensions: None,
    };
    let mut att_stmt = MapBuilder::new();
    att_stmt.push(cbor::text("sig"), cbor::bytes(registration.signature.clone()));
    att_stmt.push(
        cbor::text("x5c"),
        cbor::array(vec![cbor::bytes(registration.certificate.clone())]),
    );
    let attestation = AttestationObject::new("fido-u2f", auth_data, att_stmt.build())?;
    let response = AuthenticatorAttestationResponse {
        client_data_json,
        transports: Vec::new(),
        attestation_object: attestation.to_bytes()?,
        authenticator_data: attestation.raw_auth_data.clone(),
        public_key: public_key.to_der(),
        public_key_algorithm: alg::ES256,
    };
    Ok(PublicKeyCredential::new(
        registration.key_handle,
        response,
        BTreeMap::new(),
    ))
}

fn ctap1_get_assertion<C: SmartCardConnection>(
    session: &mut Ctap1Session<C>,
    options: &PublicKeyCredentialRequestOptions,
    rp_id: &str,
    client_data_json: Vec<u8>,
    hash: [u8; 32],
    state: Option<&CommandState>,
) -> Result<PublicKeyCredential<AuthenticatorAssertionResponse>, ClientError> {
    if options.user_verification == UserVerificationRequirement::Required {
        return Err(ClientError::ConfigurationUnsupported(
            "user verification not supported",
        ));
    }
    if options.allow_credentials.is_empty() {
        return Err(ClientError::DeviceIneligible(
            "U2F keys require an allow list",
        ));
    }
    let app_param: [u8; 32] = Sha256::digest(rp_id.as_bytes()).into();
    for credential in &options.allow_credentials {
        match session.authenticate(
            &hash,
            &app_param,
            &credential.id,
            CTRL_ENFORCE_UP_AND_SIGN,
            state,
        ) {
            Ok(signature) => {
                let mut authenticator_data = app_param.to_vec();
                authenticator_data.push(signature.user_presence & 0x01);
                authenticator_data.extend_from_slice(&signature.counter.to_be_bytes());
                let response = AuthenticatorAssertionResponse {
                    client_data_json: client_data_json.clone(),
                    authenticator_data,
                    signature: signature.signature,
                    user_handle: None,
                };
                return Ok(PublicKeyCredential::new(
                    credential.id.clone(),
                    response,
                    BTreeMap::new(),
                ));
            }
            Err(FidoError::Core(Error::Apdu { sw: SW_WRONG_DATA })) => continue,
            Err(FidoError::Ctap(CtapStatus::OperationDenied)) => {
                return Err(ClientError::Cancelled)
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(ClientError::DeviceIneligible("no eligible credentials"))
}
