use crate::{
    api::{EncodeApi, EncoderParams},
    Result, SessionConfigFailedSnafu, SessionOpenFailedSnafu,
};
use log::{debug, warn};
use scopeguard::{guard, ScopeGuard};
use snafu::ResultExt;

/// An open and initialized encode session. The function table lives inside, so the module stays
/// loaded until the session has been destroyed.
pub(crate) struct Session<A: EncodeApi> {
    handle: A::Session,
    api: A,
}

impl<A: EncodeApi> Session<A> {
    pub fn open(api: A, device: &A::Device, params: &EncoderParams) -> Result<Self> {
        let handle = api.open_session(device).context(SessionOpenFailedSnafu)?;
        let handle = guard(handle, |handle| {
            if let Err(e) = api.destroy_encoder(handle) {
                warn!("unable to destroy partially opened session: {e}");
            }
        });
        api.initialize_encoder(*handle, params).context(SessionConfigFailedSnafu)?;
        let handle = ScopeGuard::into_inner(handle);
        debug!(
            "opened encode session ({}x{} @ {}/{}, async = {})",
            params.width, params.height, params.frame_rate_numerator, params.frame_rate_denominator, params.async_mode
        );
        Ok(Self { handle, api })
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn handle(&self) -> A::Session {
        self.handle
    }
}

impl<A: EncodeApi> Drop for Session<A> {
    fn drop(&mut self) {
        match self.api.destroy_encoder(self.handle) {
            Ok(()) => debug!("closed encode session"),
            Err(e) => warn!("unable to destroy encode session: {e}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        fake::{FakeApi, Operation, Resource},
        NvencError,
    };

    fn params() -> EncoderParams {
        EncoderParams {
            width: 64,
            height: 32,
            frame_rate_numerator: 30000,
            frame_rate_denominator: 1000,
            async_mode: true,
        }
    }

    #[test]
    fn test_open_and_drop() {
        let api = FakeApi::new();
        let device = api.device();
        let session = Session::open(api.clone(), &device, &params()).unwrap();
        assert_eq!(api.live(Resource::Session), 1);
        assert_eq!(api.encoder_params(), Some(params()));
        drop(session);
        assert_eq!(api.live(Resource::Session), 0);
    }

    #[test]
    fn test_open_failure() {
        let api = FakeApi::new();
        api.fail_on(Operation::OpenSession, 0);
        let device = api.device();
        assert!(matches!(
            Session::open(api.clone(), &device, &params()),
            Err(NvencError::SessionOpenFailed { .. })
        ));
        assert_eq!(api.live(Resource::Session), 0);
    }

    #[test]
    fn test_initialize_failure_destroys_session() {
        let api = FakeApi::new();
        api.fail_on(Operation::InitializeEncoder, 0);
        let device = api.device();
        assert!(matches!(
            Session::open(api.clone(), &device, &params()),
            Err(NvencError::SessionConfigFailed { .. })
        ));
        assert_eq!(api.live(Resource::Session), 0);
        assert_eq!(api.destroyed(), vec![Resource::Session]);
    }
}
