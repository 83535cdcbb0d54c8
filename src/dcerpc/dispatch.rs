//! Service dispatch: runs a reassembled request against the handler
//! registered for its operation number.

use crate::dcerpc::services::RpcService;
use crate::dcerpc::FaultStatus;
use crate::error::{Error, Result};
use tracing::debug;

/// Run operation `opnum` of `service` on a request stub.
///
/// The handler owns the NDR work on both sides; the stub is never
/// inspected here. An opnum without a handler is
/// [`Error::UnsupportedOperation`].
pub fn dispatch(service: &dyn RpcService, opnum: u16, stub: &[u8]) -> Result<Vec<u8>> {
    let handler = service
        .operations()
        .get(opnum)
        .ok_or(Error::UnsupportedOperation(opnum))?;

    debug!(
        "{}: dispatching opnum {} with {} stub bytes",
        service.name(),
        opnum,
        stub.len()
    );
    let response = handler(stub)?;
    debug!(
        "{}: opnum {} returned {} bytes",
        service.name(),
        opnum,
        response.len()
    );
    Ok(response)
}

/// Fault status reported to the client for a failed dispatch
pub fn fault_status_for(error: &Error) -> FaultStatus {
    match error {
        Error::UnsupportedOperation(_) => FaultStatus::OpRangeError,
        _ => FaultStatus::NdrFault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcerpc::services::wkssvc::WksSvcService;
    use crate::dcerpc::services::HostIdentity;

    #[test]
    fn test_unregistered_opnum() {
        let service = WksSvcService::new(HostIdentity::default());
        let error = dispatch(&service, 99, &[]).unwrap_err();
        assert!(matches!(error, Error::UnsupportedOperation(99)));
        assert_eq!(fault_status_for(&error), FaultStatus::OpRangeError);
    }

    #[test]
    fn test_handler_decode_failure_maps_to_ndr_fault() {
        let service = WksSvcService::new(HostIdentity::default());
        let error = dispatch(&service, 0, &[0xFF]).unwrap_err();
        assert!(error.is_decode_error());
        assert_eq!(fault_status_for(&error), FaultStatus::NdrFault);
    }

    #[test]
    fn test_handler_output_is_returned_verbatim() {
        use crate::dcerpc::ndr::NdrMessage;
        use crate::dcerpc::services::wkssvc::NetrWkstaGetInfoRequest;

        let service = WksSvcService::new(HostIdentity::default());
        let stub = NetrWkstaGetInfoRequest::new("\\\\HOST", 100).to_bytes().unwrap();
        let direct = (service.operations().get(0).unwrap())(&stub).unwrap();
        assert_eq!(dispatch(&service, 0, &stub).unwrap(), direct);
    }
}
