//! The `authenticatorBioEnrollment` command: fingerprint enrollment and
//! template management.

use ciborium::value::Value;
use yubikit_core::cbor::{self, MapBuilder, MapView};
use yubikit_core::{Error, SmartCardConnection};

use super::pin_uv::PinUvAuthProtocol;
use super::{command, Ctap2Session};
use crate::{CtapStatus, FidoError, Result};

const MODALITY_FINGERPRINT: u64 = 0x01;

const SUB_ENROLL_BEGIN: u8 = 0x01;
const SUB_ENROLL_CAPTURE_NEXT: u8 = 0x02;
const SUB_CANCEL_CURRENT_ENROLLMENT: u8 = 0x03;
const SUB_ENUMERATE_ENROLLMENTS: u8 = 0x04;
const SUB_SET_FRIENDLY_NAME: u8 = 0x05;
const SUB_REMOVE_ENROLLMENT: u8 = 0x06;
const SUB_GET_FINGERPRINT_SENSOR_INFO: u8 = 0x07;

const TAG_MODALITY: i64 = 0x01;
const TAG_SUB_COMMAND: i64 = 0x02;
const TAG_SUB_PARAMS: i64 = 0x03;
const TAG_PIN_UV_AUTH_PROTOCOL: i64 = 0x04;
const TAG_PIN_UV_AUTH_PARAM: i64 = 0x05;

const PARAM_TEMPLATE_ID: i64 = 0x01;
const PARAM_FRIENDLY_NAME: i64 = 0x02;
const PARAM_TIMEOUT_MS: i64 = 0x03;

const RESP_MODALITY: i64 = 0x01;
const RESP_FINGERPRINT_KIND: i64 = 0x02;
const RESP_MAX_CAPTURE_SAMPLES: i64 = 0x03;
const RESP_TEMPLATE_ID: i64 = 0x04;
const RESP_LAST_SAMPLE_STATUS: i64 = 0x05;
const RESP_REMAINING_SAMPLES: i64 = 0x06;
const RESP_TEMPLATE_INFOS: i64 = 0x07;
const RESP_MAX_FRIENDLY_NAME: i64 = 0x08;

/// Static properties of the fingerprint sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FingerprintSensorInfo {
    pub fingerprint_kind: u64,
    pub max_capture_samples_required: u64,
    pub max_template_friendly_name: Option<u64>,
}

/// Progress of an in-flight enrollment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrollmentSample {
    pub template_id: Vec<u8>,
    pub last_sample_status: Option<u64>,
    pub remaining_samples: u64,
}

/// One enrolled template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateInfo {
    pub template_id: Vec<u8>,
    pub friendly_name: Option<String>,
}

/// Fingerprint enrollment over a CTAP2 session; authenticated with a
/// pinUvAuthToken carrying the `be` permission.
pub struct BioEnrollment<'a, C> {
    session: &'a mut Ctap2Session<C>,
    protocol: &'a dyn PinUvAuthProtocol,
    token: &'a [u8],
}

impl<'a, C: SmartCardConnection> BioEnrollment<'a, C> {
    pub fn new(
        session: &'a mut Ctap2Session<C>,
        protocol: &'a dyn PinUvAuthProtocol,
        token: &'a [u8],
    ) -> Self {
        Self {
            session,
            protocol,
            token,
        }
    }

    fn send(&mut self, sub_command: u8, params: Option<Value>) -> Result<Option<Value>> {
        let mut message = vec![MODALITY_FINGERPRINT as u8, sub_command];
        if let Some(params) = &params {
            message.extend(cbor::encode(params)?);
        }
        let auth = self.protocol.authenticate(self.token, &message);
        let mut map = MapBuilder::new();
        map.push(cbor::int(TAG_MODALITY), cbor::uint(MODALITY_FINGERPRINT));
        map.push(cbor::int(TAG_SUB_COMMAND), cbor::uint(sub_command as u64));
        map.push_opt(cbor::int(TAG_SUB_PARAMS), params);
        map.push(
            cbor::int(TAG_PIN_UV_AUTH_PROTOCOL),
            cbor::uint(self.protocol.version()),
        );
        map.push(cbor::int(TAG_PIN_UV_AUTH_PARAM), cbor::bytes(auth));
        self.session
            .send_cbor(command::BIO_ENROLLMENT, Some(map.build()))
    }

    pub fn get_sensor_info(&mut self) -> Result<FingerprintSensorInfo> {
        let body = self
            .send(SUB_GET_FINGERPRINT_SENSOR_INFO, None)?
            .ok_or(Error::BadResponse("sensor info returned no body"))?;
        let map = MapView::from_value(&body)?;
        let modality = cbor::as_u64(map.required(RESP_MODALITY)?)?;
        if modality != MODALITY_FINGERPRINT {
            return Err(Error::BadResponse("unexpected bio modality").into());
        }
        Ok(FingerprintSensorInfo {
            fingerprint_kind: cbor::as_u64(map.required(RESP_FINGERPRINT_KIND)?)?,
            max_capture_samples_required: cbor::as_u64(map.required(RESP_MAX_CAPTURE_SAMPLES)?)?,
            max_template_friendly_name: map
                .get_int(RESP_MAX_FRIENDLY_NAME)
                .map(cbor::as_u64)
                .transpose()?,
        })
    }

    /// Start enrolling a new fingerprint.
    pub fn enroll_begin(&mut self, timeout_ms: Option<u64>) -> Result<EnrollmentSample> {
        let mut params = MapBuilder::new();
        params.push_opt(cbor::int(PARAM_TIMEOUT_MS), timeout_ms.map(cbor::uint));
        let params = if params.is_empty() {
            None
        } else {
            Some(params.build())
        };
        let body = self
            .send(SUB_ENROLL_BEGIN, params)?
            .ok_or(Error::BadResponse("enrollBegin returned no body"))?;
        let map = MapView::from_value(&body)?;
        Ok(EnrollmentSample {
            template_id: cbor::as_bytes(map.required(RESP_TEMPLATE_ID)?)?.to_vec(),
            last_sample_status: map
                .get_int(RESP_LAST_SAMPLE_STATUS)
                .map(cbor::as_u64)
                .transpose()?,
            remaining_samples: cbor::as_u64(map.required(RESP_REMAINING_SAMPLES)?)?,
        })
    }

    /// Capture one more sample for the enrollment started with
    /// [`BioEnrollment::enroll_begin`].
    pub fn enroll_capture_next(
        &mut self,
        template_id: &[u8],
        timeout_ms: Option<u64>,
    ) -> Result<EnrollmentSample> {
        let mut params = MapBuilder::new();
        params.push(cbor::int(PARAM_TEMPLATE_ID), cbor::bytes(template_id));
        params.push_opt(cbor::int(PARAM_TIMEOUT_MS), timeout_ms.map(cbor::uint));
        let body = self
            .send(SUB_ENROLL_CAPTURE_NEXT, Some(params.build()))?
            .ok_or(Error::BadResponse("captureNext returned no body"))?;
        let map = MapView::from_value(&body)?;
        Ok(EnrollmentSample {
            template_id: template_id.to_vec(),
            last_sample_status: map
                .get_int(RESP_LAST_SAMPLE_STATUS)
                .map(cbor::as_u64)
                .transpose()?,
            remaining_samples: cbor::as_u64(map.required(RESP_REMAINING_SAMPLES)?)?,
        })
    }

    pub fn enroll_cancel(&mut self) -> Result<()> {
        self.send(SUB_CANCEL_CURRENT_ENROLLMENT, None)?;
        Ok(())
    }

    pub fn enumerate_enrollments(&mut self) -> Result<Vec<TemplateInfo>> {
        let body = match self.send(SUB_ENUMERATE_ENROLLMENTS, None) {
            Err(FidoError::Ctap(CtapStatus::InvalidOption)) => return Ok(Vec::new()),
            other => other?,
        }
        .ok_or(Error::BadResponse("enumerateEnrollments returned no body"))?;
        let map = MapView::from_value(&body)?;
        cbor::as_array(map.required(RESP_TEMPLATE_INFOS)?)?
            .iter()
            .map(|info| {
                let info = MapView::from_value(info)?;
                Ok(TemplateInfo {
                    template_id: cbor::as_bytes(info.required(PARAM_TEMPLATE_ID)?)?.to_vec(),
                    friendly_name: info
                        .get_int(PARAM_FRIENDLY_NAME)
                        .map(cbor::as_text)
                        .transpose()?
                        .map(str::to_string),
                })
            })
            .collect()
    }

    pub fn set_name(&mut self, template_id: &[u8], name: &str) -> Result<()> {
        let mut params = MapBuilder::new();
        params.push(cbor::int(PARAM_TEMPLATE_ID), cbor::bytes(template_id));
        params.push(cbor::int(PARAM_FRIENDLY_NAME), cbor::text(name));
        self.send(SUB_SET_FRIENDLY_NAME, Some(params.build()))?;
        Ok(())
    }

    pub fn remove_enrollment(&mut self, template_id: &[u8]) -> Result<()> {
        let mut params = MapBuilder::new();
        params.push(cbor::int(PARAM_TEMPLATE_ID), cbor::bytes(template_id));
        self.send(SUB_REMOVE_ENROLLMENT, Some(params.build()))?;
        Ok(())
    }
}
